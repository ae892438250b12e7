pub mod address_space;
pub mod arithmetics;
pub mod layout;
pub mod memory;
pub mod page_table;
