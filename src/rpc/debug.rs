//! Human-readable service table for the debug endpoint.

use std::fmt::Write;

/// One method row: signature plus call count.
pub struct MethodSummary {
    pub name: String,
    pub arg_type: &'static str,
    pub reply_type: &'static str,
    pub num_calls: u64,
}

/// One registered service and its methods.
pub struct ServiceSummary {
    pub name: String,
    pub methods: Vec<MethodSummary>,
}

/// Renders the service table as a minimal HTML page.
pub fn render(services: &[ServiceSummary]) -> String {
    let mut page = String::from(
        "<html>\n<body>\n<title>ika rpc services</title>\n",
    );
    for service in services {
        let _ = write!(
            page,
            "<hr>\nService {}\n<hr>\n<table>\n\
             <th align=center>Method</th><th align=center>Calls</th>\n",
            service.name,
        );
        for method in &service.methods {
            let _ = write!(
                page,
                "<tr>\n<td align=left font=fixed>{}({}, {}) -> result</td>\n\
                 <td align=center>{}</td>\n</tr>\n",
                method.name, method.arg_type, method.reply_type, method.num_calls,
            );
        }
        page.push_str("</table>\n");
    }
    page.push_str("</body>\n</html>");
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_services_methods_and_counts() {
        let services = vec![ServiceSummary {
            name: "Arith".into(),
            methods: vec![MethodSummary {
                name: "Sum".into(),
                arg_type: "Args",
                reply_type: "i64",
                num_calls: 3,
            }],
        }];

        let page = render(&services);
        assert!(page.contains("Service Arith"));
        assert!(page.contains("Sum(Args, i64)"));
        assert!(page.contains("<td align=center>3</td>"));
    }

    #[test]
    fn renders_an_empty_registry() {
        let page = render(&[]);
        assert!(page.starts_with("<html>"));
        assert!(!page.contains("<table>"));
    }
}
