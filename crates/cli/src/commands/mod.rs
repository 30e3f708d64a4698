pub mod acquire;
pub mod release;
