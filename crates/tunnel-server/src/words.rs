//! # Session Identifier Word Lists
//!
//! Session identifiers are `<word>-<word>`, sampled from two disjoint
//! aviation-themed lists so the two halves never repeat the same word back
//! at itself and the generated label reads like `falcon-runway` rather than
//! a raw hex string.

pub const FIRST_WORDS: &[&str] = &[
    "falcon", "condor", "eagle", "swift", "glider", "rocket", "comet", "zephyr", "cirrus",
    "nimbus", "vector", "beacon", "compass", "horizon", "meridian", "apex", "drift", "ascent",
    "cruise", "tailwind", "updraft", "skylark", "pelican", "albatross", "osprey", "raven",
    "harrier", "kestrel", "merlin", "talon",
];

pub const SECOND_WORDS: &[&str] = &[
    "runway", "hangar", "tower", "meadow", "canyon", "summit", "plateau", "ridge",
    "harbor", "channel", "gateway", "corridor", "outpost", "terminal", "airstrip", "jetstream",
    "tarmac", "skyline", "frontier", "voyage", "odyssey", "transit", "passage", "bearing",
    "heading", "altitude", "velocity", "descent", "landing",
];
