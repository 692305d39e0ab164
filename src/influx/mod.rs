// ABOUTME: InfluxDB 1.x HTTP API module
// ABOUTME: Client, wire models, and line protocol encoding

pub mod client;
pub mod line_protocol;
pub mod models;

pub use client::{quote_ident, InfluxClient};
pub use line_protocol::{encode_point, FieldValue};
pub use models::{FieldDef, FieldKind, Series};
