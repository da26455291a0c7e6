pub(crate) mod completions;
pub(crate) mod config;
pub(crate) mod list;
pub(crate) mod run;
