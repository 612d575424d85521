//! Capability contracts exchanged between game modules.
//!
//! These are traits only. Implementations live in the modules that publish
//! them; consumers look them up through the [`Broker`](crate::Broker). The
//! banner eligibility check and kill points are advisors, every other
//! contract is exclusive.

pub mod auth;
pub mod banner;
pub mod chat;
pub mod download;
pub mod help;
pub mod kill_points;
pub mod log_file;
pub mod obscenity;
pub mod prng;
pub mod redirect;
pub mod types;

pub use auth::{Auth, AuthCompletion, AuthFailure, AuthOutcome, AuthPending, AuthenticatedPlayer, LoginRequest};
pub use banner::{banner_allowed, Banner, BannerAdvisor, Banners, BANNER_SIZE};
pub use chat::{ChatHandler, ChatNet};
pub use download::{DownloadKind, FileDownload};
pub use help::Help;
pub use kill_points::{award_kill, KillContext, KillPoints, KillReward};
pub use log_file::LogFile;
pub use obscenity::ObscenityFilter;
pub use prng::Prng;
pub use redirect::{Redirect, RedirectTarget};
pub use types::{ArenaId, PlayerId};
