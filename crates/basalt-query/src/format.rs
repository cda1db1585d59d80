use basalt_common::Value;

/// Formats a value for legacy (non-`preserveType`) responses.
///
/// Doubles that are mathematically integers and fit in an i64 take the cheap
/// `<long>.00000` path; other doubles are formatted with five fractional
/// digits and a locale-independent decimal point. All other types stringify.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Double(d) => format_double(*d),
        other => other.to_string(),
    }
}

fn format_double(d: f64) -> String {
    if d >= i64::MIN as f64 && d <= i64::MAX as f64 && d.fract() == 0.0 {
        format!("{}.00000", d as i64)
    } else {
        format!("{d:.5}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_doubles_take_the_long_path() {
        assert_eq!(format_value(&Value::Double(3.0)), "3.00000");
        assert_eq!(format_value(&Value::Double(-42.0)), "-42.00000");
        assert_eq!(format_value(&Value::Double(0.0)), "0.00000");
    }

    #[test]
    fn fractional_doubles_format_with_five_digits() {
        assert_eq!(format_value(&Value::Double(3.5)), "3.50000");
        assert_eq!(format_value(&Value::Double(0.123456)), "0.12346");
    }

    #[test]
    fn huge_whole_doubles_skip_the_integer_shortcut() {
        assert_eq!(
            format_value(&Value::Double(1e20)),
            "100000000000000000000.00000"
        );
    }

    #[test]
    fn non_doubles_stringify() {
        assert_eq!(format_value(&Value::Long(7)), "7");
        assert_eq!(format_value(&Value::String("x".to_string())), "x");
    }
}
