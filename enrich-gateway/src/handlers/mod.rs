pub mod admin;
pub mod enrich;
