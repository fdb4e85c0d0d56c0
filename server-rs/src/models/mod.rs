pub mod payment;
pub mod subscription;
pub mod user;

pub use payment::*;
pub use subscription::*;
pub use user::*;
