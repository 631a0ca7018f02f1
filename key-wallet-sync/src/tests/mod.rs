//! Engine-level test suite driving full scans against a programmable
//! chain backend.

mod diff_tests;
