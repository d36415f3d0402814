pub(crate) mod lock;
pub mod ring;
