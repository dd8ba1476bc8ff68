pub mod enhance;
