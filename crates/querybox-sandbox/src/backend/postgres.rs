//! PostgreSQL client over tokio-postgres.

use std::error::Error as StdError;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Number, Value};
use tokio::task::JoinHandle;
use tokio_postgres::types::{to_sql_checked, Format, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, Statement};

use crate::adapter::{FieldInfo, RelationalClient, RowSet};
use crate::error::DbError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Param = Box<dyn ToSql + Sync + Send>;

/// One PostgreSQL connection.
pub struct PgClient {
    client: Client,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PgClient {
    /// Connect and spawn the connection driver on the current runtime.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, DbError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .user(user)
            .password(password)
            .dbname(database)
            .application_name("querybox")
            .connect_timeout(CONNECT_TIMEOUT);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| DbError::Connection(describe(&e)))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "postgres connection closed with error");
            }
        });

        tracing::debug!(host, port, database, "postgres: connected");
        Ok(Self {
            client,
            driver: Mutex::new(Some(driver)),
        })
    }

    async fn prepare(&self, sql: &str, params: &[Value]) -> Result<(Statement, Vec<Param>), DbError> {
        let statement = self.client.prepare(sql).await.map_err(query_error)?;
        let types = statement.params();
        if types.len() != params.len() {
            return Err(DbError::InvalidArgument(format!(
                "statement expects {} parameters, got {}",
                types.len(),
                params.len()
            )));
        }
        let bound = params
            .iter()
            .zip(types)
            .enumerate()
            .map(|(i, (value, ty))| {
                bind_param(value, ty).map_err(|e| {
                    DbError::InvalidArgument(format!("parameter ${}: {e}", i + 1))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((statement, bound))
    }
}

#[async_trait]
impl RelationalClient for PgClient {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<RowSet, DbError> {
        let (statement, bound) = self.prepare(sql, params).await?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        let rows = self
            .client
            .query(&statement, &refs)
            .await
            .map_err(query_error)?;

        let fields = statement
            .columns()
            .iter()
            .map(|c| FieldInfo {
                name: c.name().to_string(),
                data_type: c.type_().name().to_string(),
            })
            .collect();
        let rows = rows.iter().map(row_to_json).collect();
        Ok(RowSet { fields, rows })
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let (statement, bound) = self.prepare(sql, params).await?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(&statement, &refs)
            .await
            .map_err(query_error)
    }

    async fn close(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = driver {
            handle.abort();
        }
    }
}

impl Drop for PgClient {
    fn drop(&mut self) {
        if let Some(handle) = self
            .driver
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// Message text of a tokio-postgres error, preferring the server's own.
fn describe(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => db.message().to_string(),
        None => match e.source() {
            Some(source) => format!("{e}: {source}"),
            None => e.to_string(),
        },
    }
}

fn query_error(e: tokio_postgres::Error) -> DbError {
    let code = e.code().map(|c| c.code().to_string());
    DbError::query(describe(&e), code)
}

fn bind<T: ToSql + Sync + Send + 'static>(value: Option<T>) -> Param {
    Box::new(value)
}

fn mismatch(value: &Value, ty: &Type) -> String {
    format!("cannot bind {value} as {}", ty.name())
}

/// Convert a JSON value to the parameter type the server inferred.
fn bind_param(value: &Value, ty: &Type) -> Result<Param, String> {
    let null = value.is_null();
    let int = |min: i64, max: i64| -> Result<Option<i64>, String> {
        if null {
            return Ok(None);
        }
        value
            .as_i64()
            .filter(|n| (min..=max).contains(n))
            .map(Some)
            .ok_or_else(|| mismatch(value, ty))
    };

    let param = match *ty {
        Type::BOOL => bind(if null {
            None
        } else {
            Some(value.as_bool().ok_or_else(|| mismatch(value, ty))?)
        }),
        Type::INT2 => bind(int(i16::MIN.into(), i16::MAX.into())?.map(|n| n as i16)),
        Type::INT4 => bind(int(i32::MIN.into(), i32::MAX.into())?.map(|n| n as i32)),
        Type::INT8 => bind(int(i64::MIN, i64::MAX)?),
        Type::OID => bind(int(0, u32::MAX.into())?.map(|n| n as u32)),
        Type::FLOAT4 | Type::FLOAT8 => {
            let f = if null {
                None
            } else {
                Some(value.as_f64().ok_or_else(|| mismatch(value, ty))?)
            };
            if *ty == Type::FLOAT4 {
                bind(f.map(|f| f as f32))
            } else {
                bind(f)
            }
        }
        Type::JSON | Type::JSONB => bind(if null { None } else { Some(value.clone()) }),
        Type::UUID => bind(match value {
            Value::Null => None,
            Value::String(s) => Some(uuid::Uuid::parse_str(s).map_err(|e| e.to_string())?),
            _ => return Err(mismatch(value, ty)),
        }),
        Type::TIMESTAMPTZ => bind(match value {
            Value::Null => None,
            Value::String(s) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map_err(|e| e.to_string())?
                    .with_timezone(&Utc),
            ),
            _ => return Err(mismatch(value, ty)),
        }),
        Type::TIMESTAMP => bind(match value {
            Value::Null => None,
            Value::String(s) => Some(parse_naive_datetime(s).ok_or_else(|| mismatch(value, ty))?),
            _ => return Err(mismatch(value, ty)),
        }),
        Type::DATE => bind(match value {
            Value::Null => None,
            Value::String(s) => Some(
                NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| e.to_string())?,
            ),
            _ => return Err(mismatch(value, ty)),
        }),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => bind(match value {
            Value::Null => None,
            Value::Array(items) => Some(
                items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).ok_or_else(|| mismatch(v, ty)))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            _ => return Err(mismatch(value, ty)),
        }),
        Type::INT4_ARRAY | Type::INT8_ARRAY => {
            let items = match value {
                Value::Null => None,
                Value::Array(items) => Some(
                    items
                        .iter()
                        .map(|v| v.as_i64().ok_or_else(|| mismatch(v, ty)))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                _ => return Err(mismatch(value, ty)),
            };
            if *ty == Type::INT4_ARRAY {
                bind(
                    items
                        .map(|v| v.into_iter().map(i32::try_from).collect::<Result<Vec<_>, _>>())
                        .transpose()
                        .map_err(|e| e.to_string())?,
                )
            } else {
                bind(items)
            }
        }
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => bind(match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }),
        // NUMERIC, TIME, INTERVAL, INET, enums, ...: the server parses the text.
        _ => bind(match value {
            Value::Null => None,
            Value::String(s) => Some(TextParam(s.clone())),
            other => Some(TextParam(other.to_string())),
        }),
    };
    Ok(param)
}

/// A parameter sent in text format, for types without a binary encoder here.
#[derive(Debug)]
struct TextParam(String);

impl ToSql for TextParam {
    fn to_sql(
        &self,
        _: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        out.extend_from_slice(self.0.as_bytes());
        Ok(IsNull::No)
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    fn encode_format(&self, _: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), fmt).ok())
}

/// NUMERIC decoded to its exact decimal text.
struct NumericText(String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        decode_numeric(raw).map(NumericText).ok_or_else(|| "malformed numeric".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Any other value: its text when the binary form is UTF-8 (enums, citext,
/// ...), otherwise `\x`-prefixed hex of the raw bytes.
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(RawText(match std::str::from_utf8(raw) {
            Ok(text) => text.to_string(),
            Err(_) => bytea_hex(raw),
        }))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn decode_numeric(raw: &[u8]) -> Option<String> {
    let word = |i: usize| -> Option<u16> {
        raw.get(i * 2..i * 2 + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    };
    let ndigits = word(0)? as usize;
    let weight = word(1)? as i16 as i32;
    let sign = word(2)?;
    let dscale = word(3)? as usize;
    let digits: Vec<u16> = (0..ndigits).map(|i| word(4 + i)).collect::<Option<_>>()?;

    match sign {
        0xC000 => return Some("NaN".into()),
        0xD000 => return Some("Infinity".into()),
        0xF000 => return Some("-Infinity".into()),
        _ => {}
    }

    let digit_at = |i: i32| -> u16 {
        if i < 0 {
            0
        } else {
            digits.get(i as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                let _ = write!(out, "{}", digit_at(i));
            } else {
                let _ = write!(out, "{:04}", digit_at(i));
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", digit_at(i));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}

/// PostgreSQL's hex output for bytea: `\x` followed by lowercase hex.
fn bytea_hex(bytes: &[u8]) -> String {
    format!("\\x{}", hex::encode(bytes))
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<Option<T>> {
    row.try_get::<_, Option<T>>(idx).ok()
}

fn float(f: Option<f64>) -> Value {
    f.and_then(Number::from_f64).map_or(Value::Null, Value::Number)
}

fn column_to_json(row: &Row, idx: usize, ty: &Type) -> Value {
    let value = match *ty {
        Type::BOOL => get::<bool>(row, idx).map(|v| v.map_or(Value::Null, Value::Bool)),
        Type::INT2 => get::<i16>(row, idx).map(|v| v.map_or(Value::Null, Value::from)),
        Type::INT4 => get::<i32>(row, idx).map(|v| v.map_or(Value::Null, Value::from)),
        Type::INT8 => get::<i64>(row, idx).map(|v| v.map_or(Value::Null, Value::from)),
        Type::OID => get::<u32>(row, idx).map(|v| v.map_or(Value::Null, Value::from)),
        Type::FLOAT4 => get::<f32>(row, idx).map(|v| float(v.map(f64::from))),
        Type::FLOAT8 => get::<f64>(row, idx).map(float),
        Type::NUMERIC => get::<NumericText>(row, idx).map(|v| v.map_or(Value::Null, |n| Value::String(n.0))),
        Type::JSON | Type::JSONB => get::<Value>(row, idx).map(Option::unwrap_or_default),
        Type::UUID => get::<uuid::Uuid>(row, idx).map(|v| v.map_or(Value::Null, |u| Value::String(u.to_string()))),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx)
            .map(|v| v.map_or(Value::Null, |t| Value::String(t.to_rfc3339()))),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)
            .map(|v| v.map_or(Value::Null, |t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))),
        Type::DATE => get::<NaiveDate>(row, idx).map(|v| v.map_or(Value::Null, |d| Value::String(d.to_string()))),
        Type::TIME => get::<NaiveTime>(row, idx).map(|v| v.map_or(Value::Null, |t| Value::String(t.to_string()))),
        Type::BYTEA => get::<Vec<u8>>(row, idx)
            .map(|v| v.map_or(Value::Null, |bytes| Value::String(bytea_hex(&bytes)))),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            get::<Vec<Option<String>>>(row, idx).map(|v| serde_json::to_value(v).unwrap_or_default())
        }
        Type::INT4_ARRAY => get::<Vec<Option<i32>>>(row, idx).map(|v| serde_json::to_value(v).unwrap_or_default()),
        Type::INT8_ARRAY => get::<Vec<Option<i64>>>(row, idx).map(|v| serde_json::to_value(v).unwrap_or_default()),
        _ => None,
    };

    value
        .or_else(|| get::<String>(row, idx).map(|v| v.map_or(Value::Null, Value::String)))
        .or_else(|| get::<RawText>(row, idx).map(|v| v.map_or(Value::Null, |t| Value::String(t.0))))
        .unwrap_or(Value::Null)
}

fn row_to_json(row: &Row) -> Map<String, Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| (col.name().to_string(), column_to_json(row, idx, col.type_())))
        .collect()
}
