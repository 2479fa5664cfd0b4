// heartlink - BLE heart-rate ingestion with a resilient streaming uplink

pub mod ble;
pub mod config;
pub mod device;
pub mod host;
pub mod orchestrator;
pub mod session;
pub mod types;
pub mod uplink;

pub use config::TelemetryConfig;
pub use device::{ConnectorEvent, DeviceConnector, DeviceFeed};
pub use orchestrator::{PipelineContext, PipelineStatus, TelemetryOrchestrator};
pub use session::{SessionAggregator, SessionSnapshot};
pub use types::Sample;
pub use uplink::StreamUplink;
