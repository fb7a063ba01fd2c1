//! Address grammar and payload types shared by both transports

pub mod address;
pub mod messages;

pub use address::{
    AddressError, AddressKind, ApplicationAddress, DeviceAddress, Dialect, ACTIVATIONS_FIELD,
    MULTI_WILDCARD,
};
pub use messages::{
    Activation, ApplicationEvent, DeviceEvent, DownlinkMessage, GatewayMetadata, Metadata,
    ScheduleMode, UplinkMessage,
};
