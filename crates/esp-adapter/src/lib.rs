//! ESP Adapter (C7/§4.7): profile selection plus one
//! `EspClient` implementation per provider dialect, all converging on the
//! normalized `SendRequest`/`SendOutcome` types so the dispatch worker
//! never branches on provider.
pub mod client;
pub mod mock;
pub mod profile_select;
pub mod ses;
pub mod sparkpost;

pub use client::{EspClient, SendOutcome, SendRequest};
pub use mock::{MockEsp, Scripted};
pub use profile_select::select_profile;
pub use ses::SesClient;
pub use sparkpost::SparkPostClient;
