use super::problem::{ConvexSolver, LinearExpr, Problem, Sense, SolveOutcome, SolveStatus};
use good_lp::{
    Expression, ProblemVariables, ResolutionError, Solution, SolverModel, Variable, microlp,
    variable,
};

/// good_lp model solved with the pure-Rust microlp simplex.
#[derive(Debug, Clone, Copy, Default)]
pub struct MicroLpSolver;

impl MicroLpSolver {
    pub fn new() -> Self {
        Self
    }
}

impl ConvexSolver for MicroLpSolver {
    fn name(&self) -> &str {
        "microlp"
    }

    fn solve(&self, problem: &Problem) -> SolveOutcome {
        // 1. decision variables
        let mut vars = ProblemVariables::new();
        let handles: Vec<Variable> = problem
            .bounds()
            .iter()
            .map(|b| {
                let mut def = variable();
                if let Some(lo) = b.lower {
                    def = def.min(lo);
                }
                if let Some(hi) = b.upper {
                    def = def.max(hi);
                }
                vars.add(def)
            })
            .collect();

        // 2. objective
        let objective = to_expression(problem.objective(), &handles);
        let mut model = vars.minimise(objective).using(microlp);

        // 3. constraints
        for row in problem.constraints() {
            let lhs = to_expression(&row.expr, &handles);
            model = match row.sense {
                Sense::Le => model.with(lhs.leq(row.rhs)),
                Sense::Ge => model.with(lhs.geq(row.rhs)),
            };
        }

        log::debug!(
            "{}: solving {} variables, {} constraints",
            self.name(),
            problem.num_variables(),
            problem.num_constraints()
        );

        // 4. solve
        match model.solve() {
            Ok(solution) => {
                let values = handles.iter().map(|&v| solution.value(v)).collect();
                SolveOutcome::optimal(problem, values)
            }
            Err(ResolutionError::Infeasible) => SolveOutcome::failed(SolveStatus::Infeasible),
            Err(ResolutionError::Unbounded) => SolveOutcome::failed(SolveStatus::Unbounded),
            Err(e) => SolveOutcome::failed(SolveStatus::Error(e.to_string())),
        }
    }
}

fn to_expression(expr: &LinearExpr, handles: &[Variable]) -> Expression {
    let mut out = Expression::from(expr.constant_value());
    for &(var, coef) in expr.terms() {
        out += coef * handles[var.index()];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_lp() {
        // min x + 2y  s.t.  x + y >= 2, x <= 1.5
        let mut p = Problem::new();
        let x = p.add_nonneg();
        let y = p.add_nonneg();
        p.add_objective(&LinearExpr::from(x).with_term(y, 2.0), 1.0);
        p.geq(LinearExpr::from(x).with_term(y, 1.0), 2.0);
        p.leq(LinearExpr::from(x), 1.5);

        let out = MicroLpSolver.solve(&p);
        assert!(out.is_optimal());
        assert!((out.values[x.index()] - 1.5).abs() < 1e-7);
        assert!((out.values[y.index()] - 0.5).abs() < 1e-7);
        assert!((out.objective - 2.5).abs() < 1e-7);
    }

    #[test]
    fn test_infeasible_lp() {
        let mut p = Problem::new();
        let x = p.add_nonneg();
        p.add_objective(&LinearExpr::from(x), 1.0);
        p.geq(LinearExpr::from(x), 2.0);
        p.leq(LinearExpr::from(x), 1.0);

        let out = MicroLpSolver.solve(&p);
        assert_eq!(out.status, SolveStatus::Infeasible);
        assert!(out.values.is_empty());
    }

    #[test]
    fn test_pos_penalty_reaches_kink() {
        // min |x - 1| via two pos() terms
        let mut p = Problem::new();
        let x = p.add_nonneg();
        let d = LinearExpr::from(x).with_constant(-1.0);
        p.add_pos_penalty(&d, 1.0);
        p.add_pos_penalty(&d.scaled(-1.0), 1.0);

        let out = MicroLpSolver.solve(&p);
        assert!(out.is_optimal());
        assert!((out.values[x.index()] - 1.0).abs() < 1e-7);
        assert!(out.objective.abs() < 1e-7);
    }
}
