use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};
use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use pyo3::types::PyTuple;
use pytable_interop::config::InteropConfig;
use pytable_interop::error::{InteropError, InteropResult};
use pytable_interop::exception::PyErrorSnapshot;
use pytable_interop::object::PyHandle;

/// Days from the Common Era epoch (0001-01-01) to the Unix epoch.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

struct TemporalClasses {
    time: PyHandle,
    date: PyHandle,
    datetime: PyHandle,
    utc: PyHandle,
}

fn classes(py: Python<'_>) -> InteropResult<&'static TemporalClasses> {
    static CLASSES: GILOnceCell<TemporalClasses> = GILOnceCell::new();
    CLASSES.get_or_try_init(py, || {
        let module = py.import("datetime").map_err(|e| import_error(py, e))?;
        let config = InteropConfig::default();
        let class = |name: &str| -> InteropResult<PyHandle> {
            let attr = module.getattr(name).map_err(|e| import_error(py, e))?;
            Ok(PyHandle::adopt_bound(attr, config))
        };
        let utc = module
            .getattr("timezone")
            .and_then(|timezone| timezone.getattr("utc"))
            .map_err(|e| import_error(py, e))?;
        Ok(TemporalClasses {
            time: class("time")?,
            date: class("date")?,
            datetime: class("datetime")?,
            utc: PyHandle::adopt_bound(utc, config),
        })
    })
}

fn import_error(py: Python<'_>, err: PyErr) -> InteropError {
    InteropError::Call(PyErrorSnapshot::from_err(py, &err))
}

/// Best-effort extraction of `datetime` module values. A value of the
/// wrong class, or any Python error raised while reading it, yields
/// `None` so the caller can degrade the cell to null.
pub(super) struct PyTemporal;

impl PyTemporal {
    /// Microseconds since midnight from a `datetime.time` value.
    pub(super) fn time_micros(py: Python<'_>, value: &PyHandle) -> InteropResult<Option<i64>> {
        let classes = classes(py)?;
        if !value.is_instance(py, &classes.time).unwrap_or(false) {
            return Ok(None);
        }
        let micros = extract_time(py, value).map(|time| {
            i64::from(time.num_seconds_from_midnight()) * 1_000_000
                + i64::from(time.nanosecond()) / 1_000
        });
        Ok(micros)
    }

    /// Days since the Unix epoch from a `datetime.date` value. A
    /// `datetime.datetime` passes as a date and contributes its date
    /// part.
    pub(super) fn date_days(py: Python<'_>, value: &PyHandle) -> InteropResult<Option<i32>> {
        let classes = classes(py)?;
        if !value.is_instance(py, &classes.date).unwrap_or(false) {
            return Ok(None);
        }
        let days = extract_date(py, value).map(|date| date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE);
        Ok(days)
    }

    /// Microseconds since the Unix epoch from a `datetime.datetime`
    /// value. Aware values are converted to UTC first; naive values are
    /// taken field-for-field as UTC instants.
    pub(super) fn timestamp_utc_micros(
        py: Python<'_>,
        value: &PyHandle,
    ) -> InteropResult<Option<i64>> {
        let classes = classes(py)?;
        if !value.is_instance(py, &classes.datetime).unwrap_or(false) {
            return Ok(None);
        }
        Ok(extract_timestamp(py, value, classes))
    }
}

fn extract_timestamp(py: Python<'_>, value: &PyHandle, classes: &TemporalClasses) -> Option<i64> {
    let tzinfo = match value.attr(py, "tzinfo") {
        Ok(tzinfo) => tzinfo,
        Err(e) => {
            log::debug!("failed to read tzinfo: {e}");
            return None;
        }
    };
    let normalized = if tzinfo.is_none(py) {
        value.clone_ref(py)
    } else {
        match normalize_to_utc(py, value, classes) {
            Ok(normalized) => normalized,
            Err(e) => {
                log::debug!("failed to normalize datetime to UTC: {e}");
                return None;
            }
        }
    };
    let date = extract_date(py, &normalized)?;
    let hour = int_attr(py, &normalized, "hour")?;
    let minute = int_attr(py, &normalized, "minute")?;
    let second = int_attr(py, &normalized, "second")?;
    let micro = int_attr(py, &normalized, "microsecond")?;
    let time = NaiveTime::from_hms_micro_opt(hour, minute, second, micro)?;
    Some(date.and_time(time).and_utc().timestamp_micros())
}

fn normalize_to_utc(
    py: Python<'_>,
    value: &PyHandle,
    classes: &TemporalClasses,
) -> InteropResult<PyHandle> {
    let utc = classes.utc.bind(py)?;
    let args = PyTuple::new(py, [utc]).map_err(|e| import_error(py, e))?;
    let args = PyHandle::adopt_bound(args.into_any(), value.config());
    value.call_attr(py, "astimezone", &args)
}

fn extract_time(py: Python<'_>, value: &PyHandle) -> Option<NaiveTime> {
    let hour = int_attr(py, value, "hour")?;
    let minute = int_attr(py, value, "minute")?;
    let second = int_attr(py, value, "second")?;
    let micro = int_attr(py, value, "microsecond")?;
    NaiveTime::from_hms_micro_opt(hour, minute, second, micro)
}

fn extract_date(py: Python<'_>, value: &PyHandle) -> Option<NaiveDate> {
    let year = int_attr(py, value, "year")?;
    let month = int_attr(py, value, "month")?;
    let day = int_attr(py, value, "day")?;
    NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)
}

fn int_attr(py: Python<'_>, value: &PyHandle, name: &str) -> Option<u32> {
    match value.attr(py, name).and_then(|attr| attr.as_i64(py)) {
        Ok(v) => u32::try_from(v).ok(),
        Err(e) => {
            log::debug!("failed to read datetime attribute '{name}': {e}");
            None
        }
    }
}
