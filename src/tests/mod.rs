// Integration tests exercising full build + search flows

pub mod helpers;

mod build_and_search;
mod cascade_pipeline;
mod keyword_and_hybrid;
