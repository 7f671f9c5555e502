mod token_refresher;

pub use token_refresher::{TokenRefresher, TOKEN_REFRESH_PATH};
