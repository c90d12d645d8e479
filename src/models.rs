// Persistence records. Each record kind maps onto one DuckDB table with an
// `id BIGINT` primary key, its domain columns and an `active` flag stored as
// INTEGER 1/0. Column lists are the only identifiers ever placed into SQL
// text; every value travels as a bound parameter.
use anyhow::{Result, anyhow};
use duckdb::types::Value;

/// Table layout and row conversion for one record kind.
pub trait Entity: Sized + Send + 'static {
    const TABLE: &'static str;
    /// Columns other than `id`, in insert order.
    const COLUMNS: &'static [&'static str];
    /// Column matched by `load_by_field`.
    const LOOKUP_FIELD: &'static str;
    /// Human name used in error messages.
    const NAME: &'static str;

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    /// Values for `COLUMNS`, same order.
    fn values(&self) -> Vec<Value>;
    /// Decode a row selected as `id, COLUMNS...`.
    fn from_values(row: &[Value]) -> Result<Self>;

    fn select_list() -> String {
        std::iter::once("id")
            .chain(Self::COLUMNS.iter().copied())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn has_column(name: &str) -> bool {
        name == "id" || Self::COLUMNS.contains(&name)
    }
}

fn column(row: &[Value], idx: usize) -> Result<&Value> {
    row.get(idx)
        .ok_or_else(|| anyhow!("row has {} columns, wanted index {}", row.len(), idx))
}

fn int(row: &[Value], idx: usize) -> Result<i64> {
    match column(row, idx)? {
        Value::Null => Ok(0),
        Value::TinyInt(v) => Ok(i64::from(*v)),
        Value::SmallInt(v) => Ok(i64::from(*v)),
        Value::Int(v) => Ok(i64::from(*v)),
        Value::BigInt(v) => Ok(*v),
        Value::UTinyInt(v) => Ok(i64::from(*v)),
        Value::USmallInt(v) => Ok(i64::from(*v)),
        Value::UInt(v) => Ok(i64::from(*v)),
        Value::UBigInt(v) => i64::try_from(*v).map_err(|e| anyhow!("column {idx}: {e}")),
        Value::HugeInt(v) => i64::try_from(*v).map_err(|e| anyhow!("column {idx}: {e}")),
        other => Err(anyhow!("column {idx}: expected integer, got {other:?}")),
    }
}

fn text(row: &[Value], idx: usize) -> Result<String> {
    match column(row, idx)? {
        Value::Null => Ok(String::new()),
        Value::Text(s) => Ok(s.clone()),
        other => Err(anyhow!("column {idx}: expected text, got {other:?}")),
    }
}

fn flag(row: &[Value], idx: usize) -> Result<bool> {
    Ok(int(row, idx)? != 0)
}

fn flag_value(active: bool) -> Value {
    Value::Int(i32::from(active))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    pub id: i64,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub active: bool,
}

impl Entity for Device {
    const TABLE: &'static str = "devices";
    const COLUMNS: &'static [&'static str] = &["model", "serial", "firmware", "active"];
    const LOOKUP_FIELD: &'static str = "serial";
    const NAME: &'static str = "device";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.model.clone()),
            Value::Text(self.serial.clone()),
            Value::Text(self.firmware.clone()),
            flag_value(self.active),
        ]
    }

    fn from_values(row: &[Value]) -> Result<Self> {
        Ok(Device {
            id: int(row, 0)?,
            model: text(row, 1)?,
            serial: text(row, 2)?,
            firmware: text(row, 3)?,
            active: flag(row, 4)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceUserMapping {
    pub id: i64,
    pub user_id: i64,
    pub device_id: i64,
    pub active: bool,
}

impl Entity for DeviceUserMapping {
    const TABLE: &'static str = "device_user_mapping";
    const COLUMNS: &'static [&'static str] = &["user_id", "device_id", "active"];
    const LOOKUP_FIELD: &'static str = "device_id";
    const NAME: &'static str = "device user mapping";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::BigInt(self.user_id),
            Value::BigInt(self.device_id),
            flag_value(self.active),
        ]
    }

    fn from_values(row: &[Value]) -> Result<Self> {
        Ok(DeviceUserMapping {
            id: int(row, 0)?,
            user_id: int(row, 1)?,
            device_id: int(row, 2)?,
            active: flag(row, 3)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub nick_name: String,
    pub user_name: String,
    pub email: String,
    pub phone: String,
    pub age: i32,
    pub accepts_cookies: bool,
    pub filter_content: bool,
    pub active: bool,
}

impl Entity for User {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static [&'static str] = &[
        "fname",
        "lname",
        "nname",
        "uname",
        "email",
        "phone",
        "age",
        "accepts_cookies",
        "filter_content",
        "active",
    ];
    const LOOKUP_FIELD: &'static str = "uname";
    const NAME: &'static str = "user";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.first_name.clone()),
            Value::Text(self.last_name.clone()),
            Value::Text(self.nick_name.clone()),
            Value::Text(self.user_name.clone()),
            Value::Text(self.email.clone()),
            Value::Text(self.phone.clone()),
            Value::Int(self.age),
            flag_value(self.accepts_cookies),
            flag_value(self.filter_content),
            flag_value(self.active),
        ]
    }

    fn from_values(row: &[Value]) -> Result<Self> {
        Ok(User {
            id: int(row, 0)?,
            first_name: text(row, 1)?,
            last_name: text(row, 2)?,
            nick_name: text(row, 3)?,
            user_name: text(row, 4)?,
            email: text(row, 5)?,
            phone: text(row, 6)?,
            age: i32::try_from(int(row, 7)?)?,
            accepts_cookies: flag(row, 8)?,
            filter_content: flag(row, 9)?,
            active: flag(row, 10)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub id: i64,
    pub user_id: i64,
    pub device_id: i64,
    pub path: String,
    pub active: bool,
}

impl Entity for Image {
    const TABLE: &'static str = "images";
    const COLUMNS: &'static [&'static str] = &["user_id", "device_id", "path", "active"];
    const LOOKUP_FIELD: &'static str = "device_id";
    const NAME: &'static str = "image";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::BigInt(self.user_id),
            Value::BigInt(self.device_id),
            Value::Text(self.path.clone()),
            flag_value(self.active),
        ]
    }

    fn from_values(row: &[Value]) -> Result<Self> {
        Ok(Image {
            id: int(row, 0)?,
            user_id: int(row, 1)?,
            device_id: int(row, 2)?,
            path: text(row, 3)?,
            active: flag(row, 4)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub id: i64,
    pub user_device_mapping_id: i64,
    pub name: String,
    pub value: String,
    pub active: bool,
}

impl Entity for Settings {
    const TABLE: &'static str = "settings";
    const COLUMNS: &'static [&'static str] =
        &["user_device_mapping_id", "name", "value", "active"];
    const LOOKUP_FIELD: &'static str = "name";
    const NAME: &'static str = "settings";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::BigInt(self.user_device_mapping_id),
            Value::Text(self.name.clone()),
            Value::Text(self.value.clone()),
            flag_value(self.active),
        ]
    }

    fn from_values(row: &[Value]) -> Result<Self> {
        Ok(Settings {
            id: int(row, 0)?,
            user_device_mapping_id: int(row, 1)?,
            name: text(row, 2)?,
            value: text(row, 3)?,
            active: flag(row, 4)?,
        })
    }
}

/// Schema bootstrap, run once by the DB worker when it opens the connection.
pub const SCHEMA: &str = "
CREATE SEQUENCE IF NOT EXISTS devices_id_seq START 1;
CREATE TABLE IF NOT EXISTS devices (
    id BIGINT PRIMARY KEY DEFAULT nextval('devices_id_seq'),
    model VARCHAR,
    serial VARCHAR,
    firmware VARCHAR,
    active INTEGER
);
CREATE SEQUENCE IF NOT EXISTS device_user_mapping_id_seq START 1;
CREATE TABLE IF NOT EXISTS device_user_mapping (
    id BIGINT PRIMARY KEY DEFAULT nextval('device_user_mapping_id_seq'),
    user_id BIGINT,
    device_id BIGINT,
    active INTEGER
);
CREATE SEQUENCE IF NOT EXISTS users_id_seq START 1;
CREATE TABLE IF NOT EXISTS users (
    id BIGINT PRIMARY KEY DEFAULT nextval('users_id_seq'),
    fname VARCHAR,
    lname VARCHAR,
    nname VARCHAR,
    uname VARCHAR,
    email VARCHAR,
    phone VARCHAR,
    age INTEGER,
    accepts_cookies INTEGER,
    filter_content INTEGER,
    active INTEGER
);
CREATE SEQUENCE IF NOT EXISTS images_id_seq START 1;
CREATE TABLE IF NOT EXISTS images (
    id BIGINT PRIMARY KEY DEFAULT nextval('images_id_seq'),
    user_id BIGINT,
    device_id BIGINT,
    path VARCHAR,
    active INTEGER
);
CREATE SEQUENCE IF NOT EXISTS settings_id_seq START 1;
CREATE TABLE IF NOT EXISTS settings (
    id BIGINT PRIMARY KEY DEFAULT nextval('settings_id_seq'),
    user_device_mapping_id BIGINT,
    name VARCHAR,
    value VARCHAR,
    active INTEGER
);
";
