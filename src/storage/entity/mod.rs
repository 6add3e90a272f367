pub mod run;

pub use run::RunKind;
