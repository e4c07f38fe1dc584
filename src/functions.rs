use std::collections::HashMap;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{ApiTestError, Result};

/// A function callable from `${name(args)}` macros
pub type MacroFunction = Box<dyn Fn(&[String]) -> Result<String> + Send + Sync>;

// mobile number prefixes used by random_phone()
const PHONE_PREFIXES: [&str; 10] = ["130", "131", "132", "135", "136", "137", "138", "150", "186", "188"];

/// The closed set of functions documents may call. Nothing outside it is ever evaluated.
pub struct FunctionRegistry {
    functions: HashMap<String, MacroFunction>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FunctionRegistry {
    pub fn empty() -> Self {
        FunctionRegistry {
            functions: HashMap::new(),
        }
    }

    /// Registry with the built-in time, random and arithmetic helpers
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();

        registry.register("now", |args| {
            let format = optional_arg(args, 0).unwrap_or("%Y-%m-%d %H:%M:%S");
            format_time("now", &chrono::Local::now(), format)
        });
        registry.register("today", |_| Ok(chrono::Local::now().format("%Y-%m-%d").to_string()));
        registry.register("timestamp", |_| Ok(chrono::Utc::now().timestamp().to_string()));
        registry.register("timestamp_ms", |_| Ok(chrono::Utc::now().timestamp_millis().to_string()));
        registry.register("time_offset", |args| {
            let seconds = number_arg("time_offset", args, 0)?;
            let format = optional_arg(args, 1).unwrap_or("%Y-%m-%d %H:%M:%S");
            let shifted = chrono::Duration::try_seconds(seconds as i64)
                .and_then(|offset| chrono::Local::now().checked_add_signed(offset))
                .ok_or_else(|| ApiTestError::Function(format!("time_offset: offset of {seconds} seconds is out of range")))?;
            format_time("time_offset", &shifted, format)
        });

        registry.register("random_int", |args| {
            let min = number_arg("random_int", args, 0)? as i64;
            let max = number_arg("random_int", args, 1)? as i64;
            if min > max {
                return Err(ApiTestError::Function(format!("random_int({min}, {max}): min is greater than max")));
            }
            Ok(rand::thread_rng().gen_range(min..=max).to_string())
        });
        registry.register("random_phone", |_| {
            let mut rng = rand::thread_rng();
            let prefix = PHONE_PREFIXES[rng.gen_range(0..PHONE_PREFIXES.len())];
            let suffix: String = (0..8).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect();
            Ok(format!("{prefix}{suffix}"))
        });
        registry.register("random_string", |args| {
            let length = optional_arg(args, 0)
                .map(|_| number_arg("random_string", args, 0))
                .transpose()?
                .unwrap_or(8.0) as usize;
            Ok(rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(length)
                .map(char::from)
                .collect())
        });

        registry.register("add", |args| arithmetic("add", args, |a, b| Ok(a + b)));
        registry.register("sub", |args| arithmetic("sub", args, |a, b| Ok(a - b)));
        registry.register("mul", |args| arithmetic("mul", args, |a, b| Ok(a * b)));
        registry.register("div", |args| {
            arithmetic("div", args, |a, b| {
                if b == 0.0 {
                    Err(ApiTestError::Function("div: division by zero".to_string()))
                } else {
                    Ok(a / b)
                }
            })
        });

        registry.register("concat", |args| Ok(args.concat()));
        registry.register("upper", |args| Ok(required_arg("upper", args, 0)?.to_uppercase()));
        registry.register("lower", |args| Ok(required_arg("lower", args, 0)?.to_lowercase()));

        registry
    }

    /// Add a function to the registry, replacing a previous one with the same name
    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&[String]) -> Result<String> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Box::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn call(&self, name: &str, args: &[String]) -> Result<String> {
        let function = self.functions.get(name).ok_or_else(|| {
            ApiTestError::Function(format!("function '{name}' is not registered"))
        })?;
        log::debug!("Calling macro function {name}({})", args.join(", "));
        function(args)
    }
}

// an invalid strftime item makes chrono panic while rendering, so reject it first
fn format_time<Tz>(function: &str, time: &DateTime<Tz>, format: &str) -> Result<String>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ApiTestError::Function(format!("{function}: invalid time format '{format}'")));
    }
    Ok(time.format(format).to_string())
}

fn optional_arg(args: &[String], index: usize) -> Option<&str> {
    args.get(index).map(String::as_str).filter(|arg| !arg.is_empty())
}

fn required_arg<'a>(function: &str, args: &'a [String], index: usize) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| ApiTestError::Function(format!("{function}: missing argument #{}", index + 1)))
}

fn number_arg(function: &str, args: &[String], index: usize) -> Result<f64> {
    let raw = required_arg(function, args, index)?;
    raw.trim()
        .parse()
        .map_err(|_| ApiTestError::Function(format!("{function}: argument '{raw}' is not a number")))
}

fn arithmetic<F>(function: &str, args: &[String], op: F) -> Result<String>
where
    F: Fn(f64, f64) -> Result<f64>,
{
    if args.len() != 2 {
        return Err(ApiTestError::Function(format!("{function}: expected 2 arguments, got {}", args.len())));
    }
    let result = op(number_arg(function, args, 0)?, number_arg(function, args, 1)?)?;
    Ok(format_number(result))
}

/// Whole numbers render without a fraction, "3" rather than "3.0"
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
