//! Segment naming convention.
//!
//! Segments live at `<root>/<YYYY-MM-DD>/<Label>_<YYYY-MM-DD>_<HH-MM-SS>.<ext>`
//! and are stored remotely under `<YYYY>/<MonthName>/<DD>/<filename>`. The
//! label is normally the localized weekday name of the day the capture
//! process was launched.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, Time, Weekday};

use crate::{Error, Result};

/// The calendar day a segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey(Date);

impl DayKey {
    pub fn new(date: Date) -> Self {
        Self(date)
    }

    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        Self(dt.date())
    }

    pub fn date(&self) -> Date {
        self.0
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}",
            self.0.year(),
            self.0.month() as u8,
            self.0.day()
        )
    }
}

impl FromStr for DayKey {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        parse_date(value)
            .map(Self)
            .ok_or_else(|| Error::UnparseableName(format!("invalid day key: {value}")))
    }
}

/// Language used for weekday labels and month names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    English,
    Spanish,
}

impl Locale {
    pub fn weekday(&self, weekday: Weekday) -> &'static str {
        let idx = weekday.number_days_from_monday() as usize;
        match self {
            Locale::English => [
                "Monday",
                "Tuesday",
                "Wednesday",
                "Thursday",
                "Friday",
                "Saturday",
                "Sunday",
            ][idx],
            Locale::Spanish => [
                "Lunes",
                "Martes",
                "Miércoles",
                "Jueves",
                "Viernes",
                "Sábado",
                "Domingo",
            ][idx],
        }
    }

    pub fn month(&self, month: Month) -> &'static str {
        let idx = month as usize - 1;
        match self {
            Locale::English => [
                "January",
                "February",
                "March",
                "April",
                "May",
                "June",
                "July",
                "August",
                "September",
                "October",
                "November",
                "December",
            ][idx],
            Locale::Spanish => [
                "Enero",
                "Febrero",
                "Marzo",
                "Abril",
                "Mayo",
                "Junio",
                "Julio",
                "Agosto",
                "Septiembre",
                "Octubre",
                "Noviembre",
                "Diciembre",
            ][idx],
        }
    }
}

impl FromStr for Locale {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "en" | "english" => Ok(Locale::English),
            "es" | "spanish" => Ok(Locale::Spanish),
            other => Err(Error::Config(format!("unknown locale: {other}"))),
        }
    }
}

/// Label used for segments written on `day`.
pub fn day_label(locale: Locale, day: DayKey) -> &'static str {
    locale.weekday(day.date().weekday())
}

/// Directory holding every segment of `day`.
pub fn day_dir(root: &Path, day: DayKey) -> PathBuf {
    root.join(day.to_string())
}

/// Output pattern handed to a strftime-aware capture process.
///
/// Only the time-of-day fields are left for the capture process to expand;
/// the directory and label are fixed at launch.
pub fn strftime_pattern(root: &Path, label: &str, day: DayKey, extension: &str) -> PathBuf {
    day_dir(root, day).join(format!("{label}_%Y-%m-%d_%H-%M-%S.{extension}"))
}

/// The parsed components of a segment file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    pub label: String,
    pub date: Date,
    pub time: Time,
    pub extension: String,
}

impl SegmentName {
    /// Parses `<Label>_<YYYY-MM-DD>_<HH-MM-SS>.<ext>`. The label may itself
    /// contain underscores; date and time are taken from the right.
    pub fn parse(file_name: &str) -> Result<Self> {
        let bad = || Error::UnparseableName(file_name.to_string());

        let (stem, extension) = file_name.rsplit_once('.').ok_or_else(bad)?;
        if extension.is_empty() {
            return Err(bad());
        }
        let mut parts = stem.rsplitn(3, '_');
        let time_part = parts.next().ok_or_else(bad)?;
        let date_part = parts.next().ok_or_else(bad)?;
        let label = parts.next().ok_or_else(bad)?;
        if label.is_empty() {
            return Err(bad());
        }

        let date = parse_date(date_part).ok_or_else(bad)?;
        let time = parse_time(time_part).ok_or_else(bad)?;

        Ok(Self {
            label: label.to_string(),
            date,
            time,
            extension: extension.to_string(),
        })
    }

    /// Parses the final component of `path`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::UnparseableName(path.display().to_string()))?;
        Self::parse(name)
    }

    pub fn day_key(&self) -> DayKey {
        DayKey(self.date)
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{:02}-{:02}-{:02}.{}",
            self.label,
            self.day_key(),
            self.time.hour(),
            self.time.minute(),
            self.time.second(),
            self.extension
        )
    }

    /// Local path of this segment under `root`.
    pub fn path(&self, root: &Path) -> PathBuf {
        day_dir(root, self.day_key()).join(self.file_name())
    }

    /// Remote object key: `<YYYY>/<MonthName>/<DD>/<filename>`.
    pub fn object_key(&self, locale: Locale) -> String {
        format!(
            "{:04}/{}/{:02}/{}",
            self.date.year(),
            locale.month(self.date.month()),
            self.date.day(),
            self.file_name()
        )
    }
}

/// Case-insensitive extension check; entries may carry a leading dot.
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

fn parse_date(value: &str) -> Option<Date> {
    let mut fields = value.split('-');
    let year = parse_field::<i32>(fields.next()?, 4)?;
    let month = parse_field::<u8>(fields.next()?, 2)?;
    let day = parse_field::<u8>(fields.next()?, 2)?;
    if fields.next().is_some() {
        return None;
    }
    let month = Month::try_from(month).ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

fn parse_time(value: &str) -> Option<Time> {
    let mut fields = value.split('-');
    let hour = parse_field::<u8>(fields.next()?, 2)?;
    let minute = parse_field::<u8>(fields.next()?, 2)?;
    let second = parse_field::<u8>(fields.next()?, 2)?;
    if fields.next().is_some() {
        return None;
    }
    Time::from_hms(hour, minute, second).ok()
}

fn parse_field<T: FromStr>(value: &str, width: usize) -> Option<T> {
    if value.len() != width || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
