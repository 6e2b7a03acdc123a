//! Coupon campaigns and their pre-provisioned, single-use codes.
//!
//! Pure domain logic; the concurrent allocator lives in `pledgebank-infra`.

pub mod coupon;

pub use coupon::{Coupon, CouponCode};
