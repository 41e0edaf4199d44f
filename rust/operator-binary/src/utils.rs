use std::fmt::Write as _; // import without risk of name clashing
use std::fmt::LowerHex;

use openssl::asn1::{Asn1Time, Asn1TimeRef, TimeDiff};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{DateTime, TimeZone, Utc},
};
use time::OffsetDateTime;

/// Helper for formatting byte arrays
pub struct FmtByteSlice<'a>(pub &'a [u8]);
impl LowerHex for FmtByteSlice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            f.write_fmt(format_args!("{:02x}", byte))?;
        }
        Ok(())
    }
}

/// Combines the messages of an error and its sources into a [`String`] of the form `"error: source 1: source 2: root error"`
pub fn error_full_message(err: &dyn std::error::Error) -> String {
    // Build the full hierarchy of error messages by walking up the stack until an error
    // without `source` set is encountered and concatenating all encountered error strings.
    let mut full_msg = format!("{}", err);
    let mut curr_err = err.source();
    while let Some(curr_source) = curr_err {
        let _ = write!(full_msg, ": {}", curr_source);
        curr_err = curr_source.source();
    }
    full_msg
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Asn1TimeParseError {
    #[snafu(display("unix epoch is not a valid Asn1Time"))]
    Epoch { source: openssl::error::ErrorStack },

    #[snafu(display("unable to diff Asn1Time"))]
    Diff { source: openssl::error::ErrorStack },

    #[snafu(display("unable to parse as OffsetDateTime"))]
    Parse { source: time::error::ComponentRange },

    #[snafu(display("time overflowed"))]
    Overflow,
}

/// Converts an OpenSSL [`Asn1TimeRef`] into a Rustier [`OffsetDateTime`].
pub fn asn1time_to_offsetdatetime(asn: &Asn1TimeRef) -> Result<OffsetDateTime, Asn1TimeParseError> {
    use asn1_time_parse_error::*;
    const SECS_PER_DAY: i64 = 60 * 60 * 24;
    let epoch = Asn1Time::from_unix(0).context(EpochSnafu)?;
    let TimeDiff { days, secs } = epoch.diff(asn).context(DiffSnafu)?;
    OffsetDateTime::from_unix_timestamp(
        i64::from(days)
            .checked_mul(SECS_PER_DAY)
            .and_then(|day_secs| day_secs.checked_add(i64::from(secs)))
            .context(OverflowSnafu)?,
    )
    .context(ParseSnafu)
}

#[derive(Snafu, Debug)]
#[snafu(module)]
pub enum DateTimeOutOfBoundsError {
    #[snafu(display("datetime is invalid"))]
    DateTime,
}

/// Converts a [`time::OffsetDateTime`] into the chrono-based [`Time`] used by Kubernetes objects.
pub fn offsetdatetime_to_k8s_time(dt: OffsetDateTime) -> Result<Time, DateTimeOutOfBoundsError> {
    Utc.timestamp_opt(dt.unix_timestamp(), dt.nanosecond())
        .earliest()
        .map(Time)
        .context(date_time_out_of_bounds_error::DateTimeSnafu)
}

/// Converts a Kubernetes [`Time`] back into a [`time::OffsetDateTime`].
pub fn k8s_time_to_offsetdatetime(t: &Time) -> Result<OffsetDateTime, DateTimeOutOfBoundsError> {
    let dt: &DateTime<Utc> = &t.0;
    OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .ok()
        .and_then(|secs| secs.replace_nanosecond(dt.timestamp_subsec_nanos()).ok())
        .context(date_time_out_of_bounds_error::DateTimeSnafu)
}

#[cfg(test)]
mod tests {
    use openssl::asn1::Asn1Time;
    use time::{format_description::well_known::Rfc3339, OffsetDateTime};

    use super::{
        asn1time_to_offsetdatetime, k8s_time_to_offsetdatetime, offsetdatetime_to_k8s_time,
    };
    use crate::utils::{error_full_message, FmtByteSlice};

    #[test]
    fn fmt_hex_byte_slice() {
        assert_eq!(format!("{:x}", FmtByteSlice(&[1, 2, 255, 128])), "0102ff80");
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            error_full_message(anyhow::anyhow!("standalone error").as_ref()),
            "standalone error"
        );
        assert_eq!(
            error_full_message(
                anyhow::anyhow!("root error")
                    .context("middleware")
                    .context("leaf")
                    .as_ref()
            ),
            "leaf: middleware: root error"
        );
    }

    #[test]
    fn asn1time_to_offsetdatetime_should_work() {
        assert_eq!(
            asn1time_to_offsetdatetime(
                // Asn1Time uses a custom time format (https://www.openssl.org/docs/man3.2/man3/ASN1_TIME_set.html)
                // that is _roughly_ "ISO8601-1 without separator characters"
                &Asn1Time::from_str("20240102020304Z").unwrap()
            )
            .unwrap(),
            OffsetDateTime::parse(
                "2024-01-02T02:03:04Z",
                &time::format_description::well_known::Iso8601::DEFAULT
            )
            .unwrap()
        );
    }

    #[test]
    fn k8s_time_conversion() {
        // Conversion should normalize to UTC and preserve fractional seconds
        let dt = OffsetDateTime::parse("2021-02-04T05:23:00.123+01:00", &Rfc3339).unwrap();
        let k8s_time = offsetdatetime_to_k8s_time(dt).unwrap();
        assert_eq!(k8s_time.0.to_rfc3339(), "2021-02-04T04:23:00.123+00:00");
        assert_eq!(k8s_time_to_offsetdatetime(&k8s_time).unwrap(), dt);
    }
}
