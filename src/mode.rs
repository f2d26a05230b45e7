//! The write-mode enum shared by MDB and HDB's `put`, matching spec
//! §4.D.4's `mode ∈ {OVER, KEEP, CAT, ADDINT, ADDDBL, PROC}`.

pub enum WriteMode<'a> {
	Over,
	Keep,
	Cat,
	AddInt(i64),
	AddDouble(f64),
	Proc(&'a mut dyn FnMut(Option<&[u8]>) -> ProcResult),
}

pub enum ProcResult {
	Set(Vec<u8>),
	Delete,
	Keep,
}

/// Result of a successful `addint`/`adddouble`, or the sentinel the
/// spec calls out for a type mismatch (`INT_MIN` / NaN).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddOutcome<T> {
	Value(T),
	Mismatch,
}
