//! Reverse-mode gradients for the power criterion.
//!
//! Operations are appended to a tape as the criterion is evaluated; one
//! backward pass from the output then fills in the adjoint of every node,
//! so the bandwidth and all location coordinates are differentiated together.
//!
//! Kernel evaluations dominate the graph, so the squared distance between a
//! stored data point and a row of location variables is one fused node.
//! Data points live in an arena owned by the tape and are copied in once
//! per sample, not once per kernel evaluation.
//!
//! # Example
//!
//! One Gaussian kernel value k = exp(−‖x − v‖²/s²) with x = (1, 2) fixed:
//!
//! ```
//! use ume::tape::Tape;
//!
//! let mut tape = Tape::new();
//! let x = tape.store([1.0, 2.0]);
//! let v = tape.vars(&[1.0, 1.0]);
//! let s = tape.var(1.0);
//!
//! let d = tape.sq_dist(x, v); // ‖x − v‖² = 1
//! let s2 = tape.square(s);
//! let r = tape.div(d, s2);
//! let r = tape.neg(r);
//! let k = tape.exp(r);
//! tape.backward(k);
//!
//! let e = (-1.0f64).exp();
//! assert!((tape.val(k) - e).abs() < 1e-15);
//! assert_eq!(tape.adjoint(v.get(0)), 0.0);
//! assert!((tape.adjoint(v.get(1)) - 2.0 * e).abs() < 1e-15); // −2(v₁ − x₁)/s²·k
//! assert!((tape.adjoint(s) - 2.0 * e).abs() < 1e-15); // 2‖x − v‖²/s³·k
//! ```

/// Handle to a node on the tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var(usize);

/// A run of consecutive input variables, e.g. one test location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSlice {
    start: usize,
    len: usize,
}

impl VarSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `k`-th variable of the slice.
    pub fn get(&self, k: usize) -> Var {
        debug_assert!(k < self.len);
        Var(self.start + k)
    }
}

/// A constant point stored in the tape arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstSlice {
    start: usize,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Input,
    Const,
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Neg(usize),
    Exp(usize),
    Sqrt(usize),
    Square(usize),
    AddConst(usize),
    MulConst(usize, f64),
    /// Σₖ (arena[point + k] − var[first + k])²
    SqDist { point: usize, first: usize, len: usize },
}

#[derive(Debug, Clone)]
struct Node {
    val: f64,
    op: Op,
}

/// Reverse-mode AD tape.
#[derive(Debug, Default)]
pub struct Tape {
    nodes: Vec<Node>,
    adjoints: Vec<f64>,
    arena: Vec<f64>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            adjoints: Vec::new(),
            arena: Vec::new(),
        }
    }

    /// Number of nodes on the tape.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    fn push(&mut self, val: f64, op: Op) -> Var {
        let idx = self.nodes.len();
        self.nodes.push(Node { val, op });
        Var(idx)
    }

    // --- Leaves ---

    /// Record an input variable.
    pub fn var(&mut self, val: f64) -> Var {
        self.push(val, Op::Input)
    }

    /// Record consecutive input variables.
    pub fn vars(&mut self, vals: &[f64]) -> VarSlice {
        let start = self.nodes.len();
        for &v in vals {
            self.push(v, Op::Input);
        }
        VarSlice { start, len: vals.len() }
    }

    /// Record a constant. Its adjoint df/dc is accumulated like any other node.
    pub fn constant(&mut self, val: f64) -> Var {
        self.push(val, Op::Const)
    }

    /// Copy constant data into the arena.
    pub fn store(&mut self, data: impl IntoIterator<Item = f64>) -> ConstSlice {
        let start = self.arena.len();
        self.arena.extend(data);
        ConstSlice { start, len: self.arena.len() - start }
    }

    #[inline]
    pub fn val(&self, v: Var) -> f64 {
        self.nodes[v.0].val
    }

    // --- Binary ---

    pub fn add(&mut self, a: Var, b: Var) -> Var {
        let val = self.val(a) + self.val(b);
        self.push(val, Op::Add(a.0, b.0))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Var {
        let val = self.val(a) - self.val(b);
        self.push(val, Op::Sub(a.0, b.0))
    }

    pub fn mul(&mut self, a: Var, b: Var) -> Var {
        let val = self.val(a) * self.val(b);
        self.push(val, Op::Mul(a.0, b.0))
    }

    pub fn div(&mut self, a: Var, b: Var) -> Var {
        let val = self.val(a) / self.val(b);
        self.push(val, Op::Div(a.0, b.0))
    }

    // --- Unary ---

    pub fn neg(&mut self, a: Var) -> Var {
        let val = -self.val(a);
        self.push(val, Op::Neg(a.0))
    }

    pub fn exp(&mut self, a: Var) -> Var {
        let val = self.val(a).exp();
        self.push(val, Op::Exp(a.0))
    }

    pub fn sqrt(&mut self, a: Var) -> Var {
        let val = self.val(a).sqrt();
        self.push(val, Op::Sqrt(a.0))
    }

    pub fn square(&mut self, a: Var) -> Var {
        let v = self.val(a);
        self.push(v * v, Op::Square(a.0))
    }

    /// `a + c` for a constant `c`.
    pub fn add_const(&mut self, a: Var, c: f64) -> Var {
        let val = self.val(a) + c;
        self.push(val, Op::AddConst(a.0))
    }

    /// `a * c` for a constant `c`.
    pub fn mul_const(&mut self, a: Var, c: f64) -> Var {
        let val = self.val(a) * c;
        self.push(val, Op::MulConst(a.0, c))
    }

    /// Sum of several nodes; zero for an empty list.
    pub fn sum(&mut self, terms: &[Var]) -> Var {
        match terms.split_first() {
            None => self.constant(0.0),
            Some((&first, rest)) => rest.iter().fold(first, |acc, &t| self.add(acc, t)),
        }
    }

    /// ‖point − vars‖² with `point` a constant from the arena.
    pub fn sq_dist(&mut self, point: ConstSlice, vars: VarSlice) -> Var {
        assert_eq!(point.len, vars.len, "sq_dist operands must have equal length");
        let mut val = 0.0;
        for k in 0..point.len {
            let d = self.arena[point.start + k] - self.nodes[vars.start + k].val;
            val += d * d;
        }
        self.push(val, Op::SqDist { point: point.start, first: vars.start, len: vars.len })
    }

    // --- Backward ---

    /// Run reverse-mode AD from `out`; read results with [`adjoint`](Tape::adjoint).
    pub fn backward(&mut self, out: Var) {
        let n = self.nodes.len();
        self.adjoints.clear();
        self.adjoints.resize(n, 0.0);
        self.adjoints[out.0] = 1.0;

        for i in (0..=out.0).rev() {
            let adj = self.adjoints[i];
            if adj == 0.0 {
                continue;
            }
            match self.nodes[i].op {
                Op::Input | Op::Const => {}
                Op::Add(a, b) => {
                    self.adjoints[a] += adj;
                    self.adjoints[b] += adj;
                }
                Op::Sub(a, b) => {
                    self.adjoints[a] += adj;
                    self.adjoints[b] -= adj;
                }
                Op::Mul(a, b) => {
                    let va = self.nodes[a].val;
                    let vb = self.nodes[b].val;
                    self.adjoints[a] += adj * vb;
                    self.adjoints[b] += adj * va;
                }
                Op::Div(a, b) => {
                    let va = self.nodes[a].val;
                    let vb = self.nodes[b].val;
                    self.adjoints[a] += adj / vb;
                    self.adjoints[b] -= adj * va / (vb * vb);
                }
                Op::Neg(a) => self.adjoints[a] -= adj,
                Op::Exp(a) => self.adjoints[a] += adj * self.nodes[i].val,
                Op::Sqrt(a) => self.adjoints[a] += adj * 0.5 / self.nodes[i].val,
                Op::Square(a) => self.adjoints[a] += adj * 2.0 * self.nodes[a].val,
                Op::AddConst(a) => self.adjoints[a] += adj,
                Op::MulConst(a, c) => self.adjoints[a] += adj * c,
                Op::SqDist { point, first, len } => {
                    for k in 0..len {
                        let d = self.nodes[first + k].val - self.arena[point + k];
                        self.adjoints[first + k] += adj * 2.0 * d;
                    }
                }
            }
        }
    }

    /// ∂out/∂v after [`backward`](Tape::backward).
    #[inline]
    pub fn adjoint(&self, v: Var) -> f64 {
        self.adjoints.get(v.0).copied().unwrap_or(0.0)
    }
}
