pub mod icmp;
pub mod receiver;
pub mod sink;
pub mod socket;

pub use icmp::*;
pub use receiver::*;
pub use sink::*;
pub use socket::*;
