pub mod cohort_expansion;
pub mod cohort_models;
pub mod cohort_resolution;
