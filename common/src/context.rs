use kube::runtime::events::Reporter;

fn get_prog_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_name()?
        .to_str()?
        .to_owned()
        .into()
}

pub fn get_client_name() -> String {
    match get_prog_name() {
        Some(p) if p == "operator" => "controller.mcphive.io".to_string(),
        _ => "mcphive.io".to_string(),
    }
}

pub fn get_short_name() -> String {
    let long = get_client_name();
    let lst = long.split('.').collect::<Vec<&str>>();
    if lst.len() > 2 {
        format!("{}-{}", lst[1], lst[0])
    } else {
        "mcphive".to_string()
    }
}

pub fn get_reporter() -> Reporter {
    Reporter {
        controller: get_short_name(),
        instance: Some(std::env::var("POD_NAME").unwrap_or_else(|_| "unknown".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name_outside_of_the_operator_binary() {
        // test binaries are never called "operator"
        assert_eq!(get_client_name(), "mcphive.io");
        assert_eq!(get_short_name(), "mcphive");
        assert_eq!(get_reporter().controller, "mcphive");
    }
}
