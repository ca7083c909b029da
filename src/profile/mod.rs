pub mod manager;

pub use manager::{
    compute_folder_sizes, ProfileError, ProfileManager, ProfileSummary, RefreshReport,
};
