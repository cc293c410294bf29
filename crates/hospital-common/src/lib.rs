pub mod contentful;
pub mod error;
pub mod http;
pub mod redis;
pub mod resend;
pub mod site_api;
pub mod supabase;
