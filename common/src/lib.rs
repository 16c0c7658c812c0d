pub mod chunk;
pub mod media;
pub mod results;
pub mod task;
pub mod worker;

pub use chunk::{
    ChunkDescriptor, ChunkStatus, DispatchDescriptor, DispatchId, Outcome, TerminalNotification,
};
pub use media::{AudioCodec, AudioParams, Container, TranscodingParams, VideoCodec, VideoParams};
pub use results::TaskResults;
pub use task::{
    AudioOptionsRequest, TaskId, TaskInfo, TaskOptionsRequest, TaskRequest, TaskStatus,
    VideoOptionsRequest,
};
pub use worker::{
    DispatchRequest, DispatchResponse, NotificationResponse, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerId, WorkerMetrics, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
