//! Multi-actor membership scenarios over the in-memory store
