pub mod aggregate;
pub mod manager;
pub mod stabilizer;
