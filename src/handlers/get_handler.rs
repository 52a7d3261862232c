pub use crate::prelude::*;

/// Serves GET/HEAD for a resolved location: directory → index file or autoindex,
/// regular file → streamed download. HEAD reports the real Content-Length but
/// never attaches a body stream.
pub fn handle_get(
    request: &HttpRequest,
    r_cfg: &RouteConfig,
    s_cfg: &Arc<ServerConfig>,
) -> (HttpResponse, ActiveAction) {
    let root = &r_cfg.root;
    let relative_path = request
        .url
        .strip_prefix(&r_cfg.path)
        .unwrap_or(&request.url);
    let mut path = PathBuf::from(root);
    path.push(relative_path.trim_start_matches('/'));

    if path.is_dir() {
        let index_path = if !r_cfg.default_file.is_empty() {
            let candidate = path.join(&r_cfg.default_file);
            if candidate.is_file() {
                Some(candidate)
            } else {
                None
            }
        } else {
            None
        };

        match index_path {
            Some(candidate) => path = candidate,
            None => {
                if r_cfg.autoindex {
                    return (generate_autoindex(&path, &request.url), ActiveAction::None);
                } else {
                    let mut res = HttpResponse::new(HTTP_FORBIDDEN, "Forbidden");
                    res.set_body(
                        b"403 Forbidden: Directory listing denied".to_vec(),
                        "text/plain",
                    );
                    return (res, ActiveAction::None);
                }
            }
        }
    }

    match File::open(&path) {
        Ok(file) => {
            let Ok(metadata) = file.metadata() else {
                return (
                    handle_error(HTTP_INTERNAL_SERVER_ERROR, Some(s_cfg)),
                    ActiveAction::None,
                );
            };
            let file_size = metadata.size() as usize;
            let mime_type = get_mime_type(path.extension().and_then(|s| s.to_str()));

            let mut res = HttpResponse::new(HTTP_OK, &HttpResponse::status_text(HTTP_OK));
            res.set_header("content-length", &file_size.to_string());
            res.set_header("content-type", mime_type);

            if request.method == Method::HEAD {
                (res, ActiveAction::None)
            } else {
                (res, ActiveAction::FileDownload(file, file_size))
            }
        }
        Err(e) => {
            let code = match e.kind() {
                std::io::ErrorKind::NotFound => HTTP_NOT_FOUND,
                std::io::ErrorKind::PermissionDenied => HTTP_FORBIDDEN,
                _ => HTTP_INTERNAL_SERVER_ERROR,
            };
            (handle_error(code, Some(s_cfg)), ActiveAction::None)
        }
    }
}
