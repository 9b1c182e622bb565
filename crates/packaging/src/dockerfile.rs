use boxwright_models::{BuildStep, Recipe};

/// Dockerfile equivalent of a recipe. One instruction per build step, in
/// step order. `COPY`, `RUN` and `CMD` use the JSON array form so paths with
/// spaces stay whole and no shell reinterprets the recorded commands.
pub fn render(recipe: &Recipe) -> String {
    let mut out = String::new();
    for step in recipe.steps() {
        out.push_str(&instruction(recipe, &step));
        out.push('\n');
    }
    out
}

fn instruction(recipe: &Recipe, step: &BuildStep) -> String {
    match step {
        BuildStep::Base { image } => format!("FROM {image}"),
        BuildStep::Workdir { path } => format!("WORKDIR {path}"),
        BuildStep::CopyManifest { source } => copy(source, recipe.manifest_destination()),
        BuildStep::InstallDependencies { command } => format!("RUN {}", exec_form(command)),
        BuildStep::CopyTree(tree) => copy(
            tree.source.trim_end_matches('/'),
            tree.destination.trim_end_matches('/'),
        ),
        BuildStep::Entry { command } => format!("CMD {}", exec_form(command)),
    }
}

fn copy(source: &str, destination: &str) -> String {
    format!("COPY {}", exec_form(&[source.to_string(), format!("./{destination}")]))
}

fn exec_form(command: &[String]) -> String {
    // Serializing a slice of strings cannot fail.
    serde_json::to_string(command).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxwright_models::CopyTree;

    #[test]
    fn test_render_default_recipe() {
        let rendered = render(&Recipe::default());
        let expected = "\
FROM python:3.12-slim
WORKDIR /app
COPY [\"requirements.txt\",\"./requirements.txt\"]
RUN [\"pip\",\"install\",\"--no-cache-dir\",\"-r\",\"requirements.txt\"]
COPY [\"src\",\"./src\"]
COPY [\"additional-files\",\"./additional-files\"]
CMD [\"python\",\"src/main.py\"]
";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_render_escapes_commands() {
        let recipe = Recipe {
            entry: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo \"hi\" && exit 3".to_string(),
            ],
            trees: vec![CopyTree::new("src/", "app/src/")],
            ..Recipe::default()
        };
        let rendered = render(&recipe);
        assert!(rendered.contains("COPY [\"src\",\"./app/src\"]\n"));
        assert!(rendered.ends_with("CMD [\"sh\",\"-c\",\"echo \\\"hi\\\" && exit 3\"]\n"));
    }

    #[test]
    fn test_manifest_copied_before_install_before_sources() {
        let rendered = render(&Recipe::default());
        let manifest = rendered.find("COPY [\"requirements.txt\"").unwrap();
        let install = rendered.find("RUN ").unwrap();
        let src = rendered.find("COPY [\"src\"").unwrap();
        assert!(manifest < install && install < src);
    }

    #[test]
    fn test_copy_paths_with_spaces_stay_whole() {
        let recipe = Recipe {
            workdir: "/my app".to_string(),
            trees: vec![CopyTree::new("my files", "data")],
            ..Recipe::default()
        };
        recipe.validate().unwrap();
        let rendered = render(&recipe);
        assert!(rendered.contains("WORKDIR /my app\n"));
        assert!(rendered.contains("COPY [\"my files\",\"./data\"]\n"));
    }

    #[test]
    fn test_rendered_recipe_has_one_line_per_step() {
        let recipe = Recipe {
            trees: vec![CopyTree::new("src", "src"), CopyTree::new("my files", "data")],
            ..Recipe::default()
        };
        recipe.validate().unwrap();
        let rendered = render(&recipe);
        assert_eq!(rendered.lines().count(), recipe.steps().len());
        assert!(rendered
            .lines()
            .all(|line| ["FROM ", "WORKDIR ", "COPY [", "RUN [", "CMD ["]
                .iter()
                .any(|prefix| line.starts_with(prefix))));
    }
}
