use chrono::{DateTime, SecondsFormat, Utc};

/// 存储用的时间格式：RFC3339（UTC, 毫秒, `Z`），按字符串排序即按时间排序
pub fn to_storage_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
pub fn parse_storage_string(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// 供 rusqlite 行映射使用
#[cfg(test)]
pub(crate) fn column_datetime(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_storage_string(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
