pub mod const_fold;
pub mod cse;
pub mod dce;
pub mod flag_elim;
pub mod hints;
pub mod peephole;
pub mod sched;
pub mod strength_reduction;
