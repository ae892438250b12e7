pub mod frame_allocator;
pub mod identifier_allocator;
