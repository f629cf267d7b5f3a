//! Typed records decoded from printer messages.
//!
//! Each record kind owns one [`Schema`], built on first use and shared by
//! every decode of that kind. Decoding always produces a fresh record; the
//! caller owns it.

use crate::schema::Schema;
use serde::Serialize;
use std::sync::OnceLock;

/// A message kind the printer sends.
pub trait Record: Default + Send + 'static {
    /// Leading tag identifying the kind on the wire.
    const TAG: &'static str;

    /// Returns the kind's shared schema.
    fn schema() -> &'static Schema<Self>;

    /// Returns whether the body this record came from matched the schema.
    fn success(&self) -> bool;

    fn set_success(&mut self, success: bool);

    /// Decodes `body` into a new record, recording whether it matched.
    fn decode(body: &str) -> Self {
        let mut record = Self::default();
        let matched = Self::schema().apply(body, &mut record);
        record.set_success(matched);
        record
    }

    /// Decodes `body`, returning the record only if it matched.
    fn try_decode(body: &str) -> Option<Self> {
        let record = Self::decode(body);
        record.success().then_some(record)
    }
}

macro_rules! record {
    ($ty:ty, $tag:literal, $build:expr) => {
        impl Record for $ty {
            const TAG: &'static str = $tag;

            fn schema() -> &'static Schema<Self> {
                static SCHEMA: OnceLock<Schema<$ty>> = OnceLock::new();
                SCHEMA.get_or_init($build)
            }

            fn success(&self) -> bool {
                self.success
            }

            fn set_success(&mut self, success: bool) {
                self.success = success;
            }
        }
    };
}

/// Periodic machine state: `state;headX;headY;bedTemp;nozzleTemp;...`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateRecord {
    pub success: bool,
    pub head_x: f64,
    pub head_y: f64,
    pub bed_temp: i32,
    pub nozzle_temp: i32,
    pub bed_target_temp: i32,
    pub nozzle_target_temp: i32,
    pub fan_speed: i32,
    pub print_progress: i32,
    pub machine_status: i32,
    pub error_code: i32,
}

record!(StateRecord, "state", || {
    Schema::builder(';')
        .tag("state")
        .field(|r: &mut StateRecord, v| r.head_x = v)
        .field(|r: &mut StateRecord, v| r.head_y = v)
        .field(|r: &mut StateRecord, v| r.bed_temp = v)
        .field(|r: &mut StateRecord, v| r.nozzle_temp = v)
        .field(|r: &mut StateRecord, v| r.bed_target_temp = v)
        .field(|r: &mut StateRecord, v| r.nozzle_target_temp = v)
        .field(|r: &mut StateRecord, v| r.fan_speed = v)
        .field(|r: &mut StateRecord, v| r.print_progress = v)
        .field(|r: &mut StateRecord, v| r.machine_status = v)
        .field(|r: &mut StateRecord, v| r.error_code = v)
        .build()
});

/// Current Z offset: `ZOffsetValue:1.00`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ZOffsetRecord {
    pub success: bool,
    pub z_offset: f64,
}

record!(ZOffsetRecord, "ZOffsetValue", || {
    Schema::builder(':')
        .tag("ZOffsetValue")
        .field(|r: &mut ZOffsetRecord, v| r.z_offset = v)
        .build()
});

/// Acknowledgement that a G-code batch ran: `gcodedone;`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GCodeDoneRecord {
    pub success: bool,
}

record!(GCodeDoneRecord, "gcodedone", || {
    Schema::builder(';').tag("gcodedone").build()
});

/// Upload or print progress: `filepercent:10`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilePercentRecord {
    pub success: bool,
    pub percent: i32,
}

record!(FilePercentRecord, "filepercent", || {
    Schema::builder(':')
        .tag("filepercent")
        .field(|r: &mut FilePercentRecord, v| r.percent = v)
        .build()
});

/// Outcome of a file upload: `fend;`.
///
/// Uploads that fail before any byte is sent carry a message instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadRecord {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UploadRecord {
    /// Creates an unsuccessful record carrying `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

record!(UploadRecord, "fend", || {
    Schema::builder(';').tag("fend").build()
});

/// Outcome of a print start: `printstartsuccess;fn:name` or
/// `printstartfailed;fn:name`.
///
/// `success` says the reply was understood; `started` says whether the
/// printer actually started.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrintStartRecord {
    pub success: bool,
    pub started: bool,
    pub file_name: String,
}

record!(PrintStartRecord, "printstart", || {
    Schema::builder(';')
        .branch(&[
            ("printstartsuccess", |r: &mut PrintStartRecord| r.started = true),
            ("printstartfailed", |r: &mut PrintStartRecord| r.started = false),
        ])
        .prefixed_field("fn:", |r: &mut PrintStartRecord, v| r.file_name = v)
        .build()
});

/// Acknowledgement that printing stopped: `stopped;`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrintStopRecord {
    pub success: bool,
}

record!(PrintStopRecord, "stopped", || {
    Schema::builder(';').tag("stopped").build()
});

/// Printer identity and status:
/// `getprinterinfor;id:...;state:N;modelprinting:...;`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrinterInfoRecord {
    pub success: bool,
    pub id: String,
    pub state: i32,
    pub model_printing: String,
}

record!(PrinterInfoRecord, "getprinterinfor", || {
    Schema::builder(';')
        .tag("getprinterinfor")
        .prefixed_field("id:", |r: &mut PrinterInfoRecord, v| r.id = v)
        .prefixed_field("state:", |r: &mut PrinterInfoRecord, v| r.state = v)
        .prefixed_field("modelprinting:", |r: &mut PrinterInfoRecord, v| {
            r.model_printing = v
        })
        .build()
});

/// Current head position: `curposition:x;y;z;`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PositionRecord {
    pub success: bool,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

record!(PositionRecord, "curposition", || {
    Schema::builder(';')
        .prefixed_field("curposition:", |r: &mut PositionRecord, v| r.x = v)
        .field(|r: &mut PositionRecord, v| r.y = v)
        .field(|r: &mut PositionRecord, v| r.z = v)
        .build()
});
