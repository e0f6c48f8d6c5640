//! Volatile date/time functions. Serial numbers use the 1900 date
//! system: day 1 is 1900-01-01, with the anchor shifted to 1899-12-30 to
//! absorb the historical leap-year bug.

use chrono::{NaiveDate, Timelike};

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::value::Value;

fn serial_anchor() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).expect("anchor date is valid")
}

fn date_serial(date: NaiveDate) -> f64 {
    (date - serial_anchor()).num_days() as f64
}

pub(super) fn now(
    _args: &[Value],
    _ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let now = chrono::Local::now().naive_local();
    let day_fraction = f64::from(now.time().num_seconds_from_midnight()) / 86_400.0;
    Ok(Value::Number(date_serial(now.date()) + day_fraction))
}

pub(super) fn today(
    _args: &[Value],
    _ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    Ok(Value::Number(date_serial(chrono::Local::now().date_naive())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_numbers_use_the_1900_system() {
        // The shifted anchor counts the phantom 1900-02-29, so dates from
        // 1900-03-01 on match the file-format serials exactly.
        assert_eq!(
            date_serial(NaiveDate::from_ymd_opt(1900, 3, 1).unwrap()),
            61.0
        );
        assert_eq!(
            date_serial(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()),
            43_831.0
        );
    }
}
