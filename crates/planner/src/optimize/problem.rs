//! Solver-neutral linear program.
//!
//! The planner only ever produces piecewise-linear convex objectives, so a
//! problem is a set of bounded variables, a linear objective and linear
//! inequality rows. `pos(·)` terms are expanded into epigraph variables when
//! they are added.

/// Handle of a decision variable inside one [`Problem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(usize);

impl VarId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Σ coef·var + constant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinearExpr {
    terms: Vec<(VarId, f64)>,
    constant: f64,
}

impl LinearExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(value: f64) -> Self {
        Self {
            terms: Vec::new(),
            constant: value,
        }
    }

    pub fn add_term(&mut self, var: VarId, coef: f64) {
        if coef != 0.0 {
            self.terms.push((var, coef));
        }
    }

    pub fn add_constant(&mut self, value: f64) {
        self.constant += value;
    }

    /// self += k · other
    pub fn add_scaled(&mut self, other: &LinearExpr, k: f64) {
        if k == 0.0 {
            return;
        }
        for &(var, coef) in &other.terms {
            self.terms.push((var, k * coef));
        }
        self.constant += k * other.constant;
    }

    pub fn scaled(&self, k: f64) -> LinearExpr {
        let mut out = LinearExpr::new();
        out.add_scaled(self, k);
        out
    }

    pub fn with_term(mut self, var: VarId, coef: f64) -> Self {
        self.add_term(var, coef);
        self
    }

    pub fn with_constant(mut self, value: f64) -> Self {
        self.add_constant(value);
        self
    }

    pub fn terms(&self) -> &[(VarId, f64)] {
        &self.terms
    }

    pub fn constant_value(&self) -> f64 {
        self.constant
    }

    pub fn eval(&self, values: &[f64]) -> f64 {
        self.terms
            .iter()
            .map(|&(var, coef)| coef * values[var.index()])
            .sum::<f64>()
            + self.constant
    }
}

impl From<VarId> for LinearExpr {
    fn from(var: VarId) -> Self {
        LinearExpr::new().with_term(var, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Le,
    Ge,
}

/// expr (sense) rhs, with the expression's constant folded into rhs
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint {
    pub expr: LinearExpr,
    pub sense: Sense,
    pub rhs: f64,
}

impl LinearConstraint {
    pub fn is_satisfied(&self, values: &[f64], tol: f64) -> bool {
        let lhs = self.expr.eval(values);
        match self.sense {
            Sense::Le => lhs <= self.rhs + tol,
            Sense::Ge => lhs >= self.rhs - tol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VariableBounds {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// minimise objective subject to constraints and variable bounds
#[derive(Debug, Clone, Default)]
pub struct Problem {
    bounds: Vec<VariableBounds>,
    objective: LinearExpr,
    constraints: Vec<LinearConstraint>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, lower: Option<f64>, upper: Option<f64>) -> VarId {
        self.bounds.push(VariableBounds { lower, upper });
        VarId(self.bounds.len() - 1)
    }

    pub fn add_nonneg(&mut self) -> VarId {
        self.add_variable(Some(0.0), None)
    }

    /// objective += weight · expr
    pub fn add_objective(&mut self, expr: &LinearExpr, weight: f64) {
        self.objective.add_scaled(expr, weight);
    }

    pub fn constrain(&mut self, expr: LinearExpr, sense: Sense, rhs: f64) {
        let rhs = rhs - expr.constant;
        let expr = LinearExpr {
            terms: expr.terms,
            constant: 0.0,
        };
        self.constraints.push(LinearConstraint { expr, sense, rhs });
    }

    pub fn leq(&mut self, expr: LinearExpr, rhs: f64) {
        self.constrain(expr, Sense::Le, rhs);
    }

    pub fn geq(&mut self, expr: LinearExpr, rhs: f64) {
        self.constrain(expr, Sense::Ge, rhs);
    }

    /// New variable z with z >= 0 and z >= expr, i.e. z >= pos(expr) at optimum
    /// whenever z carries a positive objective weight or is bounded above.
    pub fn epigraph(&mut self, expr: &LinearExpr) -> VarId {
        let z = self.add_nonneg();
        let mut row = LinearExpr::from(z);
        row.add_scaled(expr, -1.0);
        self.geq(row, 0.0);
        z
    }

    /// objective += weight · pos(expr)
    pub fn add_pos_penalty(&mut self, expr: &LinearExpr, weight: f64) -> Option<VarId> {
        if weight == 0.0 {
            return None;
        }
        let z = self.epigraph(expr);
        self.add_objective(&LinearExpr::from(z), weight);
        Some(z)
    }

    pub fn num_variables(&self) -> usize {
        self.bounds.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    pub fn bounds(&self) -> &[VariableBounds] {
        &self.bounds
    }

    pub fn objective(&self) -> &LinearExpr {
        &self.objective
    }

    pub fn constraints(&self) -> &[LinearConstraint] {
        &self.constraints
    }

    pub fn objective_value(&self, values: &[f64]) -> f64 {
        self.objective.eval(values)
    }

    /// Checks bounds and rows of a candidate point.
    pub fn is_feasible(&self, values: &[f64], tol: f64) -> bool {
        values.len() == self.bounds.len()
            && self.bounds.iter().zip(values).all(|(b, &v)| {
                b.lower.is_none_or(|lo| v >= lo - tol) && b.upper.is_none_or(|hi| v <= hi + tol)
            })
            && self.constraints.iter().all(|c| c.is_satisfied(values, tol))
    }
}

/// Status reported by a solver backend.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    Unbounded,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub status: SolveStatus,
    /// one value per problem variable; empty unless optimal
    pub values: Vec<f64>,
    pub objective: f64,
}

impl SolveOutcome {
    pub fn optimal(problem: &Problem, values: Vec<f64>) -> Self {
        let objective = problem.objective_value(&values);
        Self {
            status: SolveStatus::Optimal,
            values,
            objective,
        }
    }

    pub fn failed(status: SolveStatus) -> Self {
        Self {
            status,
            values: Vec::new(),
            objective: f64::NAN,
        }
    }

    pub fn is_optimal(&self) -> bool {
        self.status == SolveStatus::Optimal
    }
}

/// Backend capable of minimising a [`Problem`].
pub trait ConvexSolver {
    fn name(&self) -> &str;
    fn solve(&self, problem: &Problem) -> SolveOutcome;
}
