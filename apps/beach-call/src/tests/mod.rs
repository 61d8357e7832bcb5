mod session;
pub(crate) mod support;
