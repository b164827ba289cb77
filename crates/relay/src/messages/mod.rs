// Room timelines: paging, posting and read receipts.

pub mod loader;
pub mod mapper;
pub mod receipts;
pub mod send;

pub use loader::{LoadedPage, MessageLoader};
pub use receipts::{ReadReceiptService, ReceiptDispatch, ReceiptOutcome};
pub use send::MessageService;
