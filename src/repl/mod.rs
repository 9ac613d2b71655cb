mod ghost;
mod ident;
mod members;
mod optime;
mod tracker;

pub use ghost::GhostSync;
pub use ident::SlaveIdent;
pub use members::{Membership, TagRule};
pub use optime::OpTime;
pub use tracker::{Client, SlaveTracker};
