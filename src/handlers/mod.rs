pub mod lnurlw;
pub mod register;
pub mod wallet;
