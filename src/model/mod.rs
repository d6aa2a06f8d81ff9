pub mod asset;
pub mod cursor;
pub mod fingerprint;
pub mod link;
pub mod price;
pub mod record;
pub mod session;
pub mod transaction;

pub use asset::AssetId;
pub use cursor::{Cursor, CursorKind, CursorPrimary};
pub use fingerprint::{link_fingerprint, transaction_fingerprint};
pub use link::{Link, LinkStatus};
pub use price::{PriceGranularity, PriceRecord};
pub use record::{NormalizedRecord, RawRecord, RecordStatus};
pub use session::{ImportSession, SessionStatus};
pub use transaction::{
    AssetMovement, Fee, FeeScope, FeeSettlement, Note, NoteSeverity, Operation,
    OperationCategory, OperationKind, Transaction, TransactionStatus,
};
