//! Prompt templates for planning and execution

/// First planning turn
pub fn planning_user(task: &str) -> String {
    format!("Generate a plan for: {}. Directly output the plan.", task)
}

/// Follow-up planning turn carrying user feedback
pub fn revise_plan_user(plan: &str, feedback: &str) -> String {
    format!(
        "Plan: {}\nFeedback: {}. Directly output the revised plan.",
        plan, feedback
    )
}

/// Developer instruction that seeds the execution transcript
pub fn execution_developer(plan: &str) -> String {
    format!(
        "Execute this plan using all available tools. If something fails, fix it and try again. \
         Keep going until it's done. Once it's done, output only one single token 'done'.\nPlan: {}",
        plan
    )
}

/// User-role diagnostic appended after a failed model turn
pub fn model_failure_user(error: &str) -> String {
    format!(
        "An error occurred, please revise your function call and try again. {}",
        error
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_instruction_ends_with_plan() {
        let text = execution_developer("1. list apps");
        assert!(text.contains("output only one single token 'done'"));
        assert!(text.ends_with("\nPlan: 1. list apps"));
    }

    #[test]
    fn test_revise_plan_format() {
        assert_eq!(
            revise_plan_user("A", "add B"),
            "Plan: A\nFeedback: add B. Directly output the revised plan."
        );
    }
}
