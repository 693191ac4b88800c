pub mod port_allocator;
