//! Reserved for future liveness-check helpers shared across binaries.
//! Currently empty: `health::HealthRegistry` covers every liveness need this
//! workspace has so far.
