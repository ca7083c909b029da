// Shared helpers: atomic file operations and size walks (fs), streaming
// SHA-256 against CDN digests (hash), media/profile URL handling (url)

pub mod fs;
pub mod hash;
pub mod url;
