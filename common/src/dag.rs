use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use crate::error::GraphError;
use crate::task::{RetryPolicy, TaskCallable, TaskId};

/// Nodo del grafo: identificador, dependencias, política de reintentos y el
/// callable opaco que ejecuta el runner.
#[derive(Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub upstream: Vec<TaskId>,
    pub retry: RetryPolicy,
    pub callable: Arc<dyn TaskCallable>,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("upstream", &self.upstream)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Construcción explícita del DAG. Nada se ejecuta hasta que `build`
/// devuelve un `TaskGraph` validado.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    tasks: Vec<TaskSpec>,
    default_retry: RetryPolicy,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Política usada por las tareas registradas sin una propia.
    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn task(
        self,
        id: &str,
        upstream: &[&str],
        callable: Arc<dyn TaskCallable>,
    ) -> Self {
        let retry = self.default_retry;
        self.task_with_retry(id, upstream, retry, callable)
    }

    pub fn task_with_retry(
        mut self,
        id: &str,
        upstream: &[&str],
        retry: RetryPolicy,
        callable: Arc<dyn TaskCallable>,
    ) -> Self {
        self.tasks.push(TaskSpec {
            id: id.to_string(),
            upstream: upstream.iter().map(|s| s.to_string()).collect(),
            retry,
            callable,
        });
        self
    }

    pub fn add(mut self, spec: TaskSpec) -> Self {
        self.tasks.push(spec);
        self
    }

    /// Valida y congela el grafo:
    /// 1. al menos una tarea
    /// 2. ids únicos
    /// 3. toda dependencia existe
    /// 4. sin ciclos
    pub fn build(self) -> Result<TaskGraph, GraphError> {
        if self.tasks.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index: HashMap<TaskId, usize> = HashMap::new();
        for (i, t) in self.tasks.iter().enumerate() {
            if index.insert(t.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(t.id.clone()));
            }
        }

        for t in &self.tasks {
            for dep in &t.upstream {
                if !index.contains_key(dep) {
                    return Err(GraphError::DanglingDependency {
                        task_id: t.id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }

        let mut downstream: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for t in &self.tasks {
            for dep in &t.upstream {
                downstream.entry(dep.clone()).or_default().push(t.id.clone());
            }
        }

        let graph = TaskGraph {
            nodes: self.tasks,
            index,
            downstream,
            order: Vec::new(),
        };

        if let Some(cycle) = graph.detect_cycle() {
            return Err(GraphError::Cycle(cycle));
        }

        let order = graph.kahn_order();
        Ok(TaskGraph { order, ..graph })
    }
}

/// DAG inmutable de tareas.
#[derive(Debug)]
pub struct TaskGraph {
    /// En orden de registro
    nodes: Vec<TaskSpec>,
    index: HashMap<TaskId, usize>,
    /// task -> tareas que dependen de ella
    downstream: HashMap<TaskId, Vec<TaskId>>,
    order: Vec<TaskId>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&TaskSpec> {
        self.index.get(id).map(|i| &self.nodes[*i])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.nodes.iter()
    }

    pub fn upstream(&self, id: &str) -> &[TaskId] {
        self.get(id).map(|t| t.upstream.as_slice()).unwrap_or(&[])
    }

    pub fn downstream(&self, id: &str) -> &[TaskId] {
        self.downstream.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Orden topológico estable: entre tareas listas gana la registrada antes.
    pub fn topo_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Todas las tareas alcanzables desde `id` por aristas de salida, en
    /// orden topológico. No incluye a `id`.
    pub fn descendants(&self, id: &str) -> Vec<TaskId> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);

        while let Some(cur) = queue.pop_front() {
            for d in self.downstream(cur) {
                if seen.insert(d.as_str()) {
                    queue.push_back(d.as_str());
                }
            }
        }

        self.order
            .iter()
            .filter(|t| seen.contains(t.as_str()))
            .cloned()
            .collect()
    }

    fn kahn_order(&self) -> Vec<TaskId> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|t| t.upstream.len()).collect();
        let mut ready: Vec<usize> = (0..self.nodes.len())
            .filter(|i| in_degree[*i] == 0)
            .collect();
        let mut out = Vec::with_capacity(self.nodes.len());

        while !ready.is_empty() {
            // el menor índice de registro primero
            ready.sort_unstable_by(|a, b| b.cmp(a));
            let Some(i) = ready.pop() else { break };
            let id = &self.nodes[i].id;
            out.push(id.clone());

            for d in self.downstream(id) {
                if let Some(j) = self.index.get(d) {
                    in_degree[*j] -= 1;
                    if in_degree[*j] == 0 {
                        ready.push(*j);
                    }
                }
            }
        }

        out
    }

    /// DFS sobre las aristas de dependencia; devuelve el camino del ciclo
    /// (`a -> b -> a`) si lo hay.
    fn detect_cycle(&self) -> Option<String> {
        let mut done: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();

        for t in &self.nodes {
            if !done.contains(t.id.as_str()) {
                if let Some(path) = self.dfs_cycle(&t.id, &mut done, &mut stack) {
                    return Some(path);
                }
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        done: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<String> {
        stack.push(node);

        for dep in self.upstream(node) {
            if let Some(pos) = stack.iter().position(|s| *s == dep.as_str()) {
                let mut path: Vec<&str> = stack[pos..].to_vec();
                path.push(dep.as_str());
                return Some(path.join(" -> "));
            }
            if !done.contains(dep.as_str()) {
                if let Some(path) = self.dfs_cycle(dep, done, stack) {
                    return Some(path);
                }
            }
        }

        stack.pop();
        done.insert(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::task::{FnTask, TaskContext, TaskOutput};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Arc<dyn TaskCallable> {
        Arc::new(FnTask(|_ctx: TaskContext| async {
            Ok::<_, TaskError>(TaskOutput::default())
        }))
    }

    #[test]
    fn orden_topologico_respeta_dependencias() {
        let g = GraphBuilder::new()
            .task("load", &["transform"], noop())
            .task("extract", &[], noop())
            .task("transform", &["extract"], noop())
            .build()
            .unwrap();

        assert_eq!(g.topo_order(), &["extract", "transform", "load"]);
        assert_eq!(g.upstream("load"), &["transform".to_string()]);
        assert_eq!(g.downstream("extract"), &["transform".to_string()]);
    }

    #[test]
    fn orden_estable_entre_tareas_independientes() {
        let g = GraphBuilder::new()
            .task("a", &[], noop())
            .task("c", &["a"], noop())
            .task("b", &["a"], noop())
            .task("d", &["b", "c"], noop())
            .build()
            .unwrap();

        assert_eq!(g.topo_order(), &["a", "c", "b", "d"]);
    }

    #[test]
    fn ciclo_falla_al_registrar_y_nada_se_ejecuta() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counting = |calls: Arc<AtomicUsize>| -> Arc<dyn TaskCallable> {
            Arc::new(FnTask(move |_ctx: TaskContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TaskError>(TaskOutput::default())
                }
            }))
        };

        let res = GraphBuilder::new()
            .task("extract", &["load"], counting(calls.clone()))
            .task("transform", &["extract"], counting(calls.clone()))
            .task("load", &["transform"], counting(calls.clone()))
            .build();

        match res {
            Err(GraphError::Cycle(path)) => {
                assert!(path.contains("extract"));
                assert!(path.contains("load"));
            }
            other => panic!("se esperaba ciclo, vino {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn autodependencia_es_ciclo() {
        let res = GraphBuilder::new().task("a", &["a"], noop()).build();
        assert!(matches!(res, Err(GraphError::Cycle(_))));
    }

    #[test]
    fn errores_de_registro() {
        assert!(matches!(GraphBuilder::new().build(), Err(GraphError::Empty)));

        let dup = GraphBuilder::new()
            .task("a", &[], noop())
            .task("a", &[], noop())
            .build();
        assert!(matches!(dup, Err(GraphError::DuplicateTask(id)) if id == "a"));

        let dangling = GraphBuilder::new().task("a", &["ghost"], noop()).build();
        assert!(matches!(
            dangling,
            Err(GraphError::DanglingDependency { ref missing, .. }) if missing == "ghost"
        ));
    }

    #[test]
    fn descendientes_en_orden_topologico() {
        let g = GraphBuilder::new()
            .task("extract", &[], noop())
            .task("transform", &["extract"], noop())
            .task("load", &["transform"], noop())
            .task("audit", &["extract"], noop())
            .build()
            .unwrap();

        assert_eq!(g.descendants("extract"), vec!["transform", "load", "audit"]);
        assert_eq!(g.descendants("transform"), vec!["load"]);
        assert!(g.descendants("load").is_empty());
    }

    #[test]
    fn politica_por_defecto_y_propia() {
        let g = GraphBuilder::new()
            .with_default_retry(RetryPolicy::no_backoff(5))
            .task("a", &[], noop())
            .task_with_retry("b", &["a"], RetryPolicy::no_backoff(1), noop())
            .build()
            .unwrap();

        assert_eq!(g.get("a").unwrap().retry.max_attempts, 5);
        assert_eq!(g.get("b").unwrap().retry.max_attempts, 1);
    }
}
