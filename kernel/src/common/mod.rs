pub mod resource_table;
