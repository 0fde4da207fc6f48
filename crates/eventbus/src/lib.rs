mod bus;
mod log_stream;
mod topics;

pub use bus::{recv_lossy, ListenerId, WorldEventBus};
pub use log_stream::{LogStream, LogStreamLayer, LogStreamSubscription};
pub use topics::{
    ActivityEvent, ActivityEventType, LogLevel, LogRecord, MessageEvent, MessageRole, SseEvent,
    SseEventType, SystemEvent, ToolEvent, ToolEventType, TokenUsage,
};
