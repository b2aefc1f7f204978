//! Compile-time defaults, merged by build.rs from the library defaults and
//! an optional user file named by `FDP_CONFIG_RS`.

include!(concat!(env!("OUT_DIR"), "/fdp_merged_config.rs"));
