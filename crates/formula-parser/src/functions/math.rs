//! Math functions
//!
//! Every numeric function returns [`Value::Undefined`] when an argument is
//! not a number or lies outside the function's domain.

use crate::value::Value;

/// All arguments as numbers, or `None` if any is not a number
fn numbers(args: &[Value]) -> Option<Vec<f64>> {
    args.iter().map(Value::as_number).collect()
}

fn unary(args: &[Value], f: impl FnOnce(f64) -> Option<f64>) -> Value {
    args.first()
        .and_then(Value::as_number)
        .and_then(f)
        .into()
}

/// SUM function
pub fn fn_sum(args: &[Value]) -> Value {
    numbers(args).map(|n| n.iter().sum::<f64>()).into()
}

/// AVERAGE function
pub fn fn_average(args: &[Value]) -> Value {
    match numbers(args) {
        Some(n) if !n.is_empty() => Value::Number(n.iter().sum::<f64>() / n.len() as f64),
        _ => Value::Undefined,
    }
}

/// MIN function
pub fn fn_min(args: &[Value]) -> Value {
    numbers(args)
        .and_then(|n| n.into_iter().reduce(f64::min))
        .into()
}

/// MAX function
pub fn fn_max(args: &[Value]) -> Value {
    numbers(args)
        .and_then(|n| n.into_iter().reduce(f64::max))
        .into()
}

/// COUNT function - counts the numeric arguments
pub fn fn_count(args: &[Value]) -> Value {
    Value::Number(args.iter().filter(|v| v.is_number()).count() as f64)
}

/// RAND() - a uniformly distributed number in [0, 1)
pub fn fn_rand(_args: &[Value]) -> Value {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    Value::Number(rng.gen::<f64>())
}

/// ABS function
pub fn fn_abs(args: &[Value]) -> Value {
    unary(args, |n| Some(n.abs()))
}

/// SQRT function
pub fn fn_sqrt(args: &[Value]) -> Value {
    unary(args, |n| (n >= 0.0).then(|| n.sqrt()))
}

/// INT function - rounds down to the nearest integer
pub fn fn_int(args: &[Value]) -> Value {
    unary(args, |n| Some(n.floor()))
}

/// SIGN function
pub fn fn_sign(args: &[Value]) -> Value {
    unary(args, |n| {
        Some(if n > 0.0 {
            1.0
        } else if n < 0.0 {
            -1.0
        } else {
            0.0
        })
    })
}

/// EXP function
pub fn fn_exp(args: &[Value]) -> Value {
    unary(args, |n| Some(n.exp()))
}

/// LN function
pub fn fn_ln(args: &[Value]) -> Value {
    unary(args, |n| (n > 0.0).then(|| n.ln()))
}

/// LOG10 function
pub fn fn_log10(args: &[Value]) -> Value {
    unary(args, |n| (n > 0.0).then(|| n.log10()))
}

pub fn fn_sin(args: &[Value]) -> Value {
    unary(args, |n| Some(n.sin()))
}

pub fn fn_cos(args: &[Value]) -> Value {
    unary(args, |n| Some(n.cos()))
}

pub fn fn_tan(args: &[Value]) -> Value {
    unary(args, |n| Some(n.tan()))
}

/// ROUND(number, [digits])
pub fn fn_round(args: &[Value]) -> Value {
    let number = match args.first() {
        Some(Value::Number(n)) => *n,
        _ => return Value::Undefined,
    };

    let num_digits = match args.get(1) {
        Some(Value::Number(n)) => *n as i32,
        None => 0,
        _ => return Value::Undefined,
    };

    // Negative digits round to the left of the decimal point
    let multiplier = 10_f64.powi(num_digits);

    // Round half away from zero: round(2.5) = 3, round(-2.5) = -3
    let result = if number >= 0.0 {
        (number * multiplier + 0.5).floor() / multiplier
    } else {
        (number * multiplier - 0.5).ceil() / multiplier
    };

    Value::Number(result)
}

/// LOG(number, [base]) - base defaults to 10
pub fn fn_log(args: &[Value]) -> Value {
    let number = match args.first() {
        Some(Value::Number(n)) if *n > 0.0 => *n,
        _ => return Value::Undefined,
    };

    let base = match args.get(1) {
        Some(Value::Number(b)) if *b > 0.0 && *b != 1.0 => *b,
        None => 10.0,
        _ => return Value::Undefined,
    };

    Value::Number(number.ln() / base.ln())
}

/// MOD(number, divisor) - the result has the sign of the divisor
pub fn fn_mod(args: &[Value]) -> Value {
    match numbers(args).as_deref() {
        Some(&[number, divisor]) if divisor != 0.0 => {
            Value::Number(number - divisor * (number / divisor).floor())
        }
        _ => Value::Undefined,
    }
}

/// POWER(base, exponent) - same as the `^` operator
pub fn fn_power(args: &[Value]) -> Value {
    match numbers(args).as_deref() {
        Some(&[base, exponent]) => Value::Number(base.powf(exponent)),
        _ => Value::Undefined,
    }
}

pub fn fn_pi(_args: &[Value]) -> Value {
    Value::Number(std::f64::consts::PI)
}
