#![deny(dead_code)]
#![deny(unused_imports)]

pub mod baselines;
pub mod data;
pub mod graph;
pub mod inference;
pub mod kernel;
pub mod model;
pub mod network;
pub mod optim;
pub mod panel;
pub mod train;
pub mod wls;
