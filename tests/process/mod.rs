//! Process supervisor tests against fake daemons.

mod lifecycle_test;
