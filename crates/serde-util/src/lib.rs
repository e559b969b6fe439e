// by default, chrono will format with 10 or so fractional digits but most
// iso datetime parsers on the operator side only support 6 digits
pub const ISO_8601_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

pub fn serialize_time<S>(
    this: &chrono::DateTime<chrono::Local>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::ser::Serializer,
{
    serializer.collect_str(&this.format(ISO_8601_FORMAT))
}

pub fn serialize_optional_time<S>(
    this: &Option<chrono::DateTime<chrono::Local>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::ser::Serializer,
{
    match this {
        Some(time) => serialize_time(time, serializer),
        None => serializer.serialize_none(),
    }
}
