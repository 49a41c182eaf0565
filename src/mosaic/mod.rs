pub mod capture;
pub mod compositor;
pub mod encode;
pub mod layout;
pub mod sync_buffer;
pub mod ticker;
