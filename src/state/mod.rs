pub mod dedup;
pub mod gc;
pub mod ledger;
pub mod refcount;
