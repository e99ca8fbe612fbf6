pub mod send;
pub mod watch;
