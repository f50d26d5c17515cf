pub mod buffer;
pub mod codec;
pub mod frame;
pub mod message;

pub use codec::{decode, encode};
pub use frame::{FrameEvent, FrameReader, FrameWriter, Header};
pub use message::{Message, MessageKind};
