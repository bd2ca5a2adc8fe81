pub mod checkout;
pub mod stock;
pub mod tally;
