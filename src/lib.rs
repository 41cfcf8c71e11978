//! Lab sensor core: observation adapters publish fixed-size telemetry
//! records into an overwrite-on-full ring buffer, and a single collector
//! task drains, decodes, de-duplicates and forwards them.
//!
//! ```text
//!  host callbacks ──▶ adapters ──▶ RingBuffer ──▶ DeliveryChannel ──▶ Collector ──▶ egress
//!   (inbound)        (normalise)   (publish)      (wait / drain)     (dedup, tags)  (jsonl, frames)
//! ```

pub mod adapters;
pub mod channel;
pub mod codec;
pub mod collector;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod error;
pub mod gate;
pub mod host;
pub mod io;
pub mod log;
pub mod model;
pub mod replay;
pub mod ring;
pub mod risk;
pub mod sensor;
pub mod sequencer;

pub use adapters::AdapterSet;
pub use channel::{DeliveryChannel, WaitOutcome};
pub use codec::{decode, encode, EncodedRecord, FORMAT_VERSION, RECORD_SIZE};
pub use collector::{CollectedEvent, CollectorReport, Emitted, SensorStats};
pub use config::SensorConfig;
pub use dedup::{DedupConfig, DedupWindow};
pub use error::{ChannelError, DecodeError, HostError, ObservationError, SensorError};
pub use host::NotificationHost;
pub use model::{EventKind, EventPayload, EventRecord, FixedStr, ProcessKey};
pub use ring::{PublishResult, RingBuffer};
pub use sensor::Sensor;
pub use sequencer::Sequencer;
