// parley-common: shared wire types for the Parley realtime relay and its clients

pub mod protocol;
pub mod types;
