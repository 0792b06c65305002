//! Protocol module - Defines the wire formats spoken with the motor and training servers
//!
//! Everything travels as single UDP datagrams:
//! - Commands and settings are flat JSON objects
//! - Inbound artifacts are text lines classified by prefix
//! - Training chunks carry an 8-byte big-endian header (index, total)
//! - Regression vectors are four little-endian f64 values

mod codec;
mod message;
mod reassembly;
mod settings;

pub use codec::*;
pub use message::*;
pub use reassembly::*;
pub use settings::*;

/// Motor settings port on the motor server
pub const SETTINGS_PORT: u16 = 3350;

/// Local port the settings confirmation arrives on
pub const CONFIRMATION_PORT: u16 = 3351;

/// Start signal port on the motor server
pub const START_PORT: u16 = 3352;

/// Disconnect signal port on the motor server
pub const DISCONNECT_PORT: u16 = 3358;

/// Regression value sink on the motor server
pub const REGRESSION_PORT: u16 = 3340;

/// Training server port
pub const TRAINING_PORT: u16 = 12346;

/// Local port trained artifacts arrive on
pub const ARTIFACT_PORT: u16 = 12347;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Prefix of a chunked binary artifact line
pub const CHUNK_MARKER: &str = "MLP_TFLITE_CHUNK";

/// Prefix of a training progress line
pub const PROGRESS_MARKER: &str = "TRAINING_PROGRESS";

/// Prefix of a server-reported failure
pub const SERVER_ERROR_MARKER: &str = "SERVER_ERROR:";

/// Substring the motor server puts in its settings confirmation
pub const CONFIRMATION_TOKEN: &str = "success";

/// Reply to a training header
pub const HEADER_ACK: &str = "HEADER_ACK";

/// Sent by the training server once every chunk arrived
pub const ALL_CHUNKS_RECEIVED: &str = "ALL_CHUNKS_RECEIVED";
