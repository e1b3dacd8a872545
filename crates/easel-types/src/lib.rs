//! Shared data types for the Easel drawing-task orchestration core.

pub mod account;
pub mod custom_id;
pub mod dictionary;
pub mod event;
pub mod submit;
pub mod task;

pub use account::{Account, SubChannel};
pub use custom_id::{PanDirection, ParsedCustomId, PicReaderTarget};
pub use dictionary::{BannedWordSet, DomainTag};
pub use event::{Attachment, ComponentRow, Embed, EventData, InteractionMetadata, MessageKind, PollUpdate};
pub use submit::{SubmitCode, SubmitResult};
pub use task::{
    generate_nonce, generate_task_id, AccountFilter, BackendFamily, BotFamily, Button, SpeedMode,
    Task, TaskAction, TaskProperties, TaskStatus,
};
