//! Test utilities for assembling script blobs.
