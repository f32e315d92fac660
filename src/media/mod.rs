pub mod protocol;
pub mod stream;

pub use protocol::{CarrierFrame, MarkPayload, MediaPayload, OutboundFrame, StartMeta};
pub use stream::{
    InboundFrameHandler, MediaEvent, MediaSocketHandle, ProtocolError, SocketCommand, SocketState,
    SocketUnavailable,
};
