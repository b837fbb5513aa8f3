//! Tree engines (`spec.md` §4.5): two lock-based BSTs that differ only
//! in how they splice out an internal node (Kung–Lehman's
//! rotation-by-replacement vs. Manber–Ladner's predecessor
//! substitution), a relaxed red-black tree with localized
//! restructuring (Hanke), and a speculation-friendly AVL tree whose
//! workers never rotate at all — a background thread does every
//! rebalance and every physical deletion.

pub mod avl;
pub mod hanke;
pub mod kung_lehman;
pub mod manber_ladner;

pub use avl::SpeculativeAvlTree;
pub use hanke::HankeTree;
pub use kung_lehman::KungLehmanTree;
pub use manber_ladner::ManberLadnerTree;
