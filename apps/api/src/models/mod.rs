pub mod tailoring;
