//! Integration tests for the loan engine
//!
//! `loan_engine` runs against the in-process store and cache. `backends`
//! needs a live Postgres and Redis and is ignored by default:
//! `DATABASE_URL=... REDIS_URL=... cargo test -- --ignored`

mod backends;
mod common;
mod loan_engine;
