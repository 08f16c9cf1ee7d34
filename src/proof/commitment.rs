//! Commitment Schemes
//!
//! A commitment binds a participant to hidden initial state: the root is
//! published, the witness stays with its owner, and later reveals are
//! checked against the root with Merkle membership proofs.
//!
//! The prover side is the `CommitmentScheme` trait. Verification never
//! crosses the trust boundary through dynamic dispatch: it is dispatched on
//! the `scheme_tag` string over the closed set of known schemes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::canonical::{canonical_bytes, CanonicalError};
use crate::core::hash::{digest_hex, Digest};
use crate::proof::merkle::{MerkleError, MerkleProof, MerkleTree};

/// Scheme tag of the grid membership reference scheme.
pub const GRID_SCHEME_TAG: &str = "grid-membership-v1";

/// Commitment errors.
#[derive(Debug, Error)]
pub enum CommitmentError {
    /// The scheme tag names no known scheme.
    #[error("unknown commitment scheme: {0}")]
    UnknownScheme(String),

    /// The query does not fit the scheme.
    #[error("malformed query for scheme")]
    BadQuery,

    /// A grid position lies outside the committed grid.
    #[error("position ({x}, {y}) outside {grid_size}x{grid_size} grid")]
    PositionOutOfGrid {
        /// Queried column.
        x: u32,
        /// Queried row.
        y: u32,
        /// Committed grid dimension.
        grid_size: u32,
    },

    /// A revealed witness does not parse.
    #[error("malformed witness")]
    BadWitness,

    /// Proof construction failed inside the tree.
    #[error(transparent)]
    Merkle(#[from] MerkleError),

    /// A value could not be canonically encoded.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// The public half of a commitment: what goes on the wire at COMMIT time.
/// No witness field ever appears here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentPublic {
    /// Root digest binding the hidden witness.
    #[serde(with = "digest_hex")]
    pub root: Digest,
    /// Name of the scheme the root was built with.
    pub scheme_tag: String,
    /// Scheme parameters a verifier needs (for the grid scheme, the
    /// dimension that fixes the leaf count).
    pub params: BTreeMap<String, u64>,
}

/// Prover-side surface of a commitment scheme.
///
/// Implementations must be hiding (the root is pseudorandom in the witness
/// under a fresh seed), binding (distinct witnesses with equal roots are
/// infeasible), and deterministic (same witness and seed, same root).
pub trait CommitmentScheme: Send {
    /// Scheme name as carried in `CommitmentPublic.scheme_tag`.
    fn scheme_tag(&self) -> &'static str;

    /// Root digest of the commitment.
    fn commit_root(&self) -> Digest;

    /// The shareable public half.
    fn public(&self) -> CommitmentPublic;

    /// Produce a membership proof answering a scheme-specific query.
    fn prove(&self, query: &Value) -> Result<MerkleProof, CommitmentError>;

    /// Disclose the full witness for post-session audit.
    fn reveal(&self) -> Value;
}

/// A cell query against the grid scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridQuery {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
}

/// The fact a grid proof reveals: one cell and whether it is marked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedCell {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
    /// Whether the cell is in the committed marked set.
    pub marked: bool,
}

/// Reference scheme: commitment to a set of marked cells on a square grid.
///
/// Cells are enumerated in row-major order; every leaf embeds the private
/// seed, which makes the root pseudorandom in the witness. A verifier never
/// reconstructs leaf bytes (it lacks the seed); it folds the `leaf_value`
/// carried inside each proof instead.
pub struct GridCommitment {
    grid_size: u32,
    marked: BTreeSet<(u32, u32)>,
    seed: Vec<u8>,
    tree: MerkleTree,
}

impl GridCommitment {
    /// Commit to `marked` positions on a `grid_size` x `grid_size` grid
    /// under a private seed.
    pub fn new(
        grid_size: u32,
        marked: impl IntoIterator<Item = (u32, u32)>,
        seed: &[u8],
    ) -> Result<Self, CommitmentError> {
        let marked: BTreeSet<(u32, u32)> = marked.into_iter().collect();
        for &(x, y) in &marked {
            if x >= grid_size || y >= grid_size {
                return Err(CommitmentError::PositionOutOfGrid { x, y, grid_size });
            }
        }

        let seed_hex = hex::encode(seed);
        let mut leaves = Vec::with_capacity((grid_size as usize).pow(2));
        for x in 0..grid_size {
            for y in 0..grid_size {
                let is_marked = marked.contains(&(x, y));
                leaves.push(leaf_bytes(x, y, is_marked, &seed_hex)?);
            }
        }

        Ok(Self {
            grid_size,
            marked,
            seed: seed.to_vec(),
            tree: MerkleTree::from_leaves(&leaves),
        })
    }

    /// Committed grid dimension.
    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    /// Produce the proof for one cell.
    pub fn prove_cell(&self, query: GridQuery) -> Result<MerkleProof, CommitmentError> {
        if query.x >= self.grid_size || query.y >= self.grid_size {
            return Err(CommitmentError::PositionOutOfGrid {
                x: query.x,
                y: query.y,
                grid_size: self.grid_size,
            });
        }
        let index = (query.x * self.grid_size + query.y) as usize;
        Ok(self.tree.prove(index)?)
    }

    /// Whether a cell is in the committed marked set.
    pub fn is_marked(&self, query: GridQuery) -> bool {
        self.marked.contains(&(query.x, query.y))
    }

    /// Verify a grid membership proof against a published commitment.
    ///
    /// Checks, in order: the published parameters fix a leaf count, the
    /// decoded leaf agrees with the query and the asserted fact, the leaf
    /// index matches the queried cell, and the Merkle path folds to the
    /// root. The asserted fact is bound by the leaf bytes inside the proof,
    /// so claiming a different outcome than was committed cannot verify.
    pub fn verify_proof(
        public: &CommitmentPublic,
        query: GridQuery,
        asserted_marked: bool,
        proof: &MerkleProof,
    ) -> bool {
        let Some(grid_size) = public.params.get("grid_size").copied() else {
            return false;
        };
        if grid_size == 0 || query.x as u64 >= grid_size || query.y as u64 >= grid_size {
            return false;
        }
        let leaf_count = (grid_size * grid_size) as usize;

        let Some(cell) = decode_leaf(&proof.leaf_value) else {
            return false;
        };
        if cell.x != query.x || cell.y != query.y || cell.marked != asserted_marked {
            return false;
        }
        if proof.leaf_index != query.x as u64 * grid_size + query.y as u64 {
            return false;
        }

        MerkleTree::verify(&public.root, proof, leaf_count)
    }

    /// Check a revealed witness against a published commitment by
    /// recomputing the root from scratch.
    pub fn verify_revealed_witness(public: &CommitmentPublic, witness: &Value) -> bool {
        let Ok(revealed) = serde_json::from_value::<GridWitness>(witness.clone()) else {
            return false;
        };
        let Ok(seed) = hex::decode(&revealed.seed) else {
            return false;
        };
        let Ok(rebuilt) = GridCommitment::new(revealed.grid_size, revealed.marked_positions, &seed)
        else {
            return false;
        };
        rebuilt.commit_root() == public.root
    }
}

impl CommitmentScheme for GridCommitment {
    fn scheme_tag(&self) -> &'static str {
        GRID_SCHEME_TAG
    }

    fn commit_root(&self) -> Digest {
        self.tree.root()
    }

    fn public(&self) -> CommitmentPublic {
        let mut params = BTreeMap::new();
        params.insert("grid_size".to_string(), self.grid_size as u64);
        CommitmentPublic {
            root: self.commit_root(),
            scheme_tag: GRID_SCHEME_TAG.to_string(),
            params,
        }
    }

    fn prove(&self, query: &Value) -> Result<MerkleProof, CommitmentError> {
        let query: GridQuery =
            serde_json::from_value(query.clone()).map_err(|_| CommitmentError::BadQuery)?;
        self.prove_cell(query)
    }

    fn reveal(&self) -> Value {
        json!({
            "grid_size": self.grid_size,
            "marked_positions": self.marked.iter().collect::<Vec<_>>(),
            "seed": hex::encode(&self.seed),
        })
    }
}

/// Serialized grid witness, as produced by `GridCommitment::reveal`.
#[derive(Debug, Deserialize)]
struct GridWitness {
    grid_size: u32,
    marked_positions: Vec<(u32, u32)>,
    seed: String,
}

/// Verify a membership proof for any known scheme, dispatching on the tag.
///
/// `asserted` is the revealed fact accompanying the proof. For the grid
/// scheme it is either a bare bool or an object carrying a `marked` (or
/// `hit`) bool; the queried cell comes from `query`.
pub fn verify_membership(
    public: &CommitmentPublic,
    query: &Value,
    asserted: &Value,
    proof: &MerkleProof,
) -> bool {
    match public.scheme_tag.as_str() {
        GRID_SCHEME_TAG => {
            let Ok(query) = serde_json::from_value::<GridQuery>(query.clone()) else {
                return false;
            };
            let Some(marked) = asserted_bool(asserted) else {
                return false;
            };
            GridCommitment::verify_proof(public, query, marked, proof)
        }
        _ => false,
    }
}

/// Decode the fact fields out of grid leaf bytes.
///
/// The leaf is canonical JSON of `{marked, seed, x, y}`; the seed stays
/// opaque to the caller.
pub fn decode_leaf(leaf_value: &[u8]) -> Option<RevealedCell> {
    let value: Value = serde_json::from_slice(leaf_value).ok()?;
    Some(RevealedCell {
        x: value.get("x")?.as_u64()? as u32,
        y: value.get("y")?.as_u64()? as u32,
        marked: value.get("marked")?.as_bool()?,
    })
}

/// Extract the asserted bool from a revealed fact value.
fn asserted_bool(asserted: &Value) -> Option<bool> {
    match asserted {
        Value::Bool(b) => Some(*b),
        Value::Object(map) => map
            .get("marked")
            .or_else(|| map.get("hit"))
            .and_then(Value::as_bool),
        _ => None,
    }
}

fn leaf_bytes(x: u32, y: u32, marked: bool, seed_hex: &str) -> Result<Vec<u8>, CanonicalError> {
    canonical_bytes(&json!({
        "marked": marked,
        "seed": seed_hex,
        "x": x,
        "y": y,
    }))
}
