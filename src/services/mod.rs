pub mod alias;
pub mod duplicate_guard;
pub mod invoice_directory;
pub mod ledger;
pub mod reconcile;
pub mod stock_adjustment;
