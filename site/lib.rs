#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Local-site computations for single-shot decentralized ridge regression.
//!
//! A site runs once per round. Round one fits ordinary least squares on the site's own rows and
//! caches its tables; round two, given the aggregator's global estimates, reports residual and
//! total sums of squares and the design cross-product. See [`local::run`].

pub mod data;
pub mod faer_ndarray;
pub mod local;
pub mod phase;
pub mod settings;
pub mod stats;
pub mod table;
pub mod types;
