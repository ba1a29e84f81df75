pub mod cookie;
pub mod id;
pub mod jar;
pub mod session;

pub use cookie::{cookie_exclude, crc16_string, parse_cookie_header, session_cookie_name};
pub use id::SessionId;
pub use jar::{Cookie, CookieJar};
pub use session::{Session, SessionManager};
